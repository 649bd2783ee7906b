use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DownloadError, SegmentFailure};
use crate::plan::SegmentHandle;
use crate::source::{ByteStream, RangeSource};
use crate::store::{SegmentStore, SegmentWriter};

/// Fetches one segment and commits it to the store under its index.
///
/// The body is written to the store as it arrives. Returns the number of
/// bytes stored. On any failure nothing is stored for this index.
pub async fn fetch_segment(
    source: Arc<dyn RangeSource>,
    store: Arc<dyn SegmentStore>,
    url: &str,
    handle: SegmentHandle,
    cancel: CancellationToken,
) -> Result<u64, DownloadError> {
    let fail = |cause: SegmentFailure| DownloadError::Fetch { index: handle.index, cause };

    let body = tokio::select! {
        biased;

        _ = cancel.cancelled() => return Err(fail(SegmentFailure::Cancelled)),

        result = source.fetch(url, handle.range) => result.map_err(|e| fail(e.into()))?,
    };

    let mut writer = store
        .create(handle.index)
        .await
        .map_err(|e| fail(SegmentFailure::Store(e)))?;

    if let Err(cause) = pump(body, writer.as_mut(), &cancel).await {
        writer.discard().await;
        return Err(fail(cause));
    }

    let written = writer.commit().await.map_err(|e| fail(SegmentFailure::Store(e)))?;

    debug!(
        segment = handle.index,
        start = handle.range.start,
        end = handle.range.end,
        bytes = written,
        "segment stored"
    );

    Ok(written)
}

async fn pump(
    mut body: ByteStream,
    writer: &mut dyn SegmentWriter,
    cancel: &CancellationToken,
) -> Result<(), SegmentFailure> {
    loop {
        let chunk = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(SegmentFailure::Cancelled),

            chunk = body.next() => chunk,
        };

        match chunk {
            Some(data) => writer.write_chunk(&data?).await.map_err(SegmentFailure::Store)?,
            None => return Ok(()),
        }
    }
}
