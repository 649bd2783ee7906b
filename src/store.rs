use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};

pub type SegmentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Named temporary byte buffers addressed by segment index.
///
/// Each concurrent fetch task writes a distinct index, so implementations
/// need no cross-index locking.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Starts a buffer for `index`. Nothing is readable under that index
    /// until the writer is committed.
    async fn create(&self, index: usize) -> io::Result<Box<dyn SegmentWriter>>;

    async fn open(&self, index: usize) -> io::Result<SegmentReader>;

    /// Committed size of the buffer in bytes.
    async fn size(&self, index: usize) -> io::Result<u64>;

    async fn remove(&self, index: usize) -> io::Result<()>;

    async fn contains(&self, index: usize) -> bool;

    /// Called once every buffer has been consumed.
    async fn release(&self) -> io::Result<()> {
        Ok(())
    }
}

/// An uncommitted segment buffer being filled chunk by chunk.
#[async_trait]
pub trait SegmentWriter: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;

    /// Makes the buffer visible under its index. Returns the bytes written.
    async fn commit(self: Box<Self>) -> io::Result<u64>;

    /// Drops everything written so far.
    async fn discard(self: Box<Self>);
}

/// Segment buffers as `section-<index>.tmp` files in one directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<target>.segments/` next to the target file.
    pub fn for_target(target: &Path) -> Self {
        let mut name = target.as_os_str().to_owned();
        name.push(".segments");
        Self::new(PathBuf::from(name))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("section-{}.tmp", index))
    }
}

#[async_trait]
impl SegmentStore for DiskStore {
    async fn create(&self, index: usize) -> io::Result<Box<dyn SegmentWriter>> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.segment_path(index);
        let staged = path.with_extension("tmp.part");
        let file = fs::File::create(&staged).await?;

        Ok(Box::new(DiskWriter {
            file: BufWriter::with_capacity(512 * 1024, file),
            staged,
            path,
            written: 0,
        }))
    }

    async fn open(&self, index: usize) -> io::Result<SegmentReader> {
        let file = fs::File::open(self.segment_path(index)).await?;
        Ok(Box::new(file))
    }

    async fn size(&self, index: usize) -> io::Result<u64> {
        Ok(fs::metadata(self.segment_path(index)).await?.len())
    }

    async fn remove(&self, index: usize) -> io::Result<()> {
        fs::remove_file(self.segment_path(index)).await
    }

    async fn contains(&self, index: usize) -> bool {
        fs::metadata(self.segment_path(index)).await.is_ok()
    }

    async fn release(&self) -> io::Result<()> {
        match fs::remove_dir(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Writes to `section-<index>.tmp.part`; commit renames it into place.
struct DiskWriter {
    file: BufWriter<fs::File>,
    staged: PathBuf,
    path: PathBuf,
    written: u64,
}

#[async_trait]
impl SegmentWriter for DiskWriter {
    async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> io::Result<u64> {
        let DiskWriter { mut file, staged, path, written } = *self;

        let synced = async {
            file.flush().await?;
            file.get_ref().sync_all().await
        }
        .await;
        drop(file);

        let committed = match synced {
            Ok(()) => fs::rename(&staged, &path).await,
            Err(e) => Err(e),
        };

        match committed {
            Ok(()) => Ok(written),
            Err(e) => {
                let _ = fs::remove_file(&staged).await;
                Err(e)
            }
        }
    }

    async fn discard(self: Box<Self>) {
        let DiskWriter { file, staged, .. } = *self;
        drop(file);
        let _ = fs::remove_file(&staged).await;
    }
}

/// Writes and commits a whole buffer in one go.
#[cfg(test)]
pub async fn put(store: &dyn SegmentStore, index: usize, data: &[u8]) -> io::Result<()> {
    let mut writer = store.create(index).await?;
    writer.write_chunk(data).await?;
    writer.commit().await.map(|_| ())
}

#[cfg(test)]
pub async fn read_all(store: &dyn SegmentStore, index: usize) -> io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut reader = store.open(index).await?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await?;
    Ok(data)
}
