use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::error::DownloadError;
use crate::plan::SegmentHandle;
use crate::store::SegmentStore;

/// Where the merger accumulates output before it is renamed onto the target.
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Reassembles segment buffers into `target` in ascending index order,
/// deleting each buffer once it has been appended.
///
/// Output is appended to `<target>.part`, which replaces `target` only after
/// the last segment. On failure the `.part` file and any unmerged buffers are
/// left where they are.
pub async fn merge_segments(
    store: &dyn SegmentStore,
    target: &Path,
    segments: &[SegmentHandle],
) -> Result<u64, DownloadError> {
    let mut ordered = segments.to_vec();
    ordered.sort_by_key(|h| h.index);

    let first = ordered.first().map(|h| h.index).unwrap_or(0);
    let fail = |index: usize| move |cause: io::Error| DownloadError::Merge { index, cause };

    let staged = staging_path(target);
    match fs::remove_file(&staged).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(fail(first)(e)),
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&staged)
        .await
        .map_err(fail(first))?;
    let mut out = BufWriter::with_capacity(512 * 1024, file);

    let mut written: u64 = 0;

    for handle in &ordered {
        let expected = handle.range.len();
        let size = store.size(handle.index).await.map_err(fail(handle.index))?;
        if size != expected {
            return Err(fail(handle.index)(short_buffer(size, expected)));
        }

        let mut reader = store.open(handle.index).await.map_err(fail(handle.index))?;
        let copied = tokio::io::copy(&mut reader, &mut out).await.map_err(fail(handle.index))?;
        out.flush().await.map_err(fail(handle.index))?;
        if copied != expected {
            return Err(fail(handle.index)(short_buffer(copied, expected)));
        }
        drop(reader);

        store.remove(handle.index).await.map_err(fail(handle.index))?;

        written += copied;
        debug!(segment = handle.index, bytes = copied, "segment merged");
    }

    let last = ordered.last().map(|h| h.index).unwrap_or(first);
    out.flush().await.map_err(fail(last))?;
    out.get_ref().sync_all().await.map_err(fail(last))?;
    drop(out);

    fs::rename(&staged, target).await.map_err(fail(last))?;

    Ok(written)
}

fn short_buffer(actual: u64, expected: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("segment buffer holds {} bytes, expected {}", actual, expected),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{handles, plan_ranges};
    use crate::store::{put, DiskStore, SegmentReader, SegmentWriter};
    use async_trait::async_trait;
    use tempfile::TempDir;

    async fn stored(dir: &Path, data: &[u8], segments: usize) -> (DiskStore, Vec<SegmentHandle>) {
        let store = DiskStore::new(dir.join("segs"));
        let hs = handles(&plan_ranges(data.len() as u64, segments).unwrap());
        for h in &hs {
            let r = h.range;
            put(&store, h.index, &data[r.start as usize..=r.end as usize]).await.unwrap();
        }
        (store, hs)
    }

    #[tokio::test]
    async fn test_merge_reassembles_in_index_order() {
        let temp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let (store, mut hs) = stored(temp.path(), &data, 7).await;
        hs.reverse();

        let target = temp.path().join("out.bin");
        let n = merge_segments(&store, &target, &hs).await.unwrap();

        assert_eq!(n, 1000);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        for h in &hs {
            assert!(!store.contains(h.index).await);
        }
        assert!(!staging_path(&target).exists());
    }

    #[tokio::test]
    async fn test_merge_replaces_existing_target() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("out.bin");
        std::fs::write(&target, b"stale contents").unwrap();

        let (store, hs) = stored(temp.path(), b"fresh", 2).await;
        merge_segments(&store, &target, &hs).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_missing_segment_aborts_with_index() {
        let temp = TempDir::new().unwrap();
        let data = b"abcdefghij";
        let (store, hs) = stored(temp.path(), data, 5).await;
        store.remove(3).await.unwrap();

        let target = temp.path().join("out.bin");
        let err = merge_segments(&store, &target, &hs).await.unwrap_err();

        match err {
            DownloadError::Merge { index, cause } => {
                assert_eq!(index, 3);
                assert_eq!(cause.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // Merged prefix is left in the staging file, later buffers untouched.
        assert!(!target.exists());
        assert_eq!(std::fs::read(staging_path(&target)).unwrap(), b"abcdef");
        assert!(!store.contains(0).await);
        assert!(store.contains(4).await);
    }

    #[tokio::test]
    async fn test_short_segment_is_rejected() {
        let temp = TempDir::new().unwrap();
        let (store, hs) = stored(temp.path(), b"0123456789", 2).await;
        put(&store, 1, b"56").await.unwrap();

        let err = merge_segments(&store, &temp.path().join("out.bin"), &hs).await.unwrap_err();
        match err {
            DownloadError::Merge { index, cause } => {
                assert_eq!(index, 1);
                assert_eq!(cause.kind(), io::ErrorKind::InvalidData);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    struct UndeletableStore(DiskStore);

    #[async_trait]
    impl SegmentStore for UndeletableStore {
        async fn create(&self, index: usize) -> io::Result<Box<dyn SegmentWriter>> {
            self.0.create(index).await
        }

        async fn open(&self, index: usize) -> io::Result<SegmentReader> {
            self.0.open(index).await
        }

        async fn size(&self, index: usize) -> io::Result<u64> {
            self.0.size(index).await
        }

        async fn remove(&self, _index: usize) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }

        async fn contains(&self, index: usize) -> bool {
            self.0.contains(index).await
        }
    }

    #[tokio::test]
    async fn test_delete_failure_aborts_merge() {
        let temp = TempDir::new().unwrap();
        let (store, hs) = stored(temp.path(), b"0123456789", 3).await;
        let store = UndeletableStore(store);

        let err = merge_segments(&store, &temp.path().join("out.bin"), &hs).await.unwrap_err();
        assert!(matches!(err, DownloadError::Merge { index: 0, .. }));
        assert!(store.contains(1).await);
    }
}
