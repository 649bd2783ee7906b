use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use reqwest::{header, Client, StatusCode};
use std::pin::Pin;
use std::time::Duration;

use crate::error::SourceError;
use crate::plan::ByteRange;

/// Body of a ranged fetch, delivered chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, SourceError>> + Send>>;

/// The remote side of a download: something that can report a resource's
/// size and hand back an arbitrary byte range of it.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Metadata request without a body. `Ok(None)` means the server answered
    /// with a success status but did not declare a usable size.
    async fn probe(&self, url: &str) -> Result<Option<u64>, SourceError>;

    /// Starts fetching `range`. The stream yields exactly `range.len()` bytes
    /// or ends with an error.
    async fn fetch(&self, url: &str, range: ByteRange) -> Result<ByteStream, SourceError>;
}

pub struct HttpSource {
    client: Client,
    strict: bool,
}

impl HttpSource {
    pub fn new(
        user_agent: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
        strict: bool,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self::from_client(client, strict))
    }

    pub fn from_client(client: Client, strict: bool) -> Self {
        Self { client, strict }
    }

    fn check_status(&self, status: StatusCode, headers: &header::HeaderMap, range: ByteRange) -> Result<(), SourceError> {
        if !self.strict {
            return if status.is_success() { Ok(()) } else { Err(SourceError::Status(status)) };
        }

        if status == StatusCode::PARTIAL_CONTENT {
            validate_content_range(headers, range)
        } else if status == StatusCode::OK && range.start == 0 {
            // Server ignored the Range header; the body length check decides
            // whether the whole resource is what we asked for.
            Ok(())
        } else if status == StatusCode::OK {
            Err(SourceError::Protocol(format!(
                "server ignored range request {}",
                range.header_value()
            )))
        } else {
            Err(SourceError::Status(status))
        }
    }
}

#[async_trait]
impl RangeSource for HttpSource {
    async fn probe(&self, url: &str) -> Result<Option<u64>, SourceError> {
        let resp = self.client.head(url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }

        Ok(extract_content_length(resp.headers()))
    }

    async fn fetch(&self, url: &str, range: ByteRange) -> Result<ByteStream, SourceError> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, range.header_value())
            .send()
            .await?;

        self.check_status(response.status(), response.headers(), range)?;

        Ok(limit_to_range(response.bytes_stream(), range))
    }
}

/// Passes chunks through while counting them against the range length.
/// Ends with a protocol error if the server sends more or fewer bytes.
fn limit_to_range<S>(body: S, range: ByteRange) -> ByteStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let expected = range.len();
    let state = (Box::pin(body), 0u64, false);

    Box::pin(stream::unfold(state, move |(mut body, received, done)| async move {
        if done {
            return None;
        }
        match body.next().await {
            Some(Ok(chunk)) => {
                let received = received + chunk.len() as u64;
                if received > expected {
                    let err = SourceError::Protocol(format!(
                        "server sent excess data for range {}: expected {} bytes, got at least {}",
                        range.header_value(),
                        expected,
                        received,
                    ));
                    return Some((Err(err), (body, received, true)));
                }
                Some((Ok(chunk), (body, received, false)))
            }
            Some(Err(e)) => Some((Err(SourceError::from(e)), (body, received, true))),
            None if received != expected => {
                let err = SourceError::Protocol(format!(
                    "truncated range {}: expected {} bytes, got {}",
                    range.header_value(),
                    expected,
                    received,
                ));
                Some((Err(err), (body, received, true)))
            }
            None => None,
        }
    }))
}

/// A body that yields `data` as a single chunk.
#[cfg(test)]
pub fn stream_of(data: Vec<u8>) -> ByteStream {
    Box::pin(stream::iter([Ok(Bytes::from(data))]))
}

/// Reads `Content-Length` straight from the headers. HEAD responses carry no
/// body, so the response's own length hint is not reliable here.
fn extract_content_length(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|&len| len > 0)
}

fn validate_content_range(headers: &header::HeaderMap, range: ByteRange) -> Result<(), SourceError> {
    let value = headers
        .get(header::CONTENT_RANGE)
        .ok_or_else(|| SourceError::Protocol("server returned 206 without Content-Range".into()))?
        .to_str()
        .map_err(|_| SourceError::Protocol("Content-Range is not valid UTF-8".into()))?;

    let bad = || SourceError::Protocol(format!("unexpected Content-Range: '{}'", value));

    let (range_part, _) = value
        .strip_prefix("bytes ")
        .and_then(|rest| rest.split_once('/'))
        .ok_or_else(bad)?;
    let (start, end) = range_part.split_once('-').ok_or_else(bad)?;
    let actual_start: u64 = start.parse().map_err(|_| bad())?;
    let actual_end: u64 = end.parse().map_err(|_| bad())?;

    if actual_start != range.start || actual_end != range.end {
        return Err(SourceError::Protocol(format!(
            "Content-Range mismatch: requested {}-{}, got '{}'",
            range.start, range.end, value
        )));
    }

    Ok(())
}
