use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, SegmentFailure, SourceError};
use crate::fetch;
use crate::merge;
use crate::plan::{self, SegmentHandle};
use crate::source::RangeSource;
use crate::store::SegmentStore;

/// One download attempt: where from, where to, how many segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    url: String,
    target: PathBuf,
    segments: usize,
}

impl DownloadJob {
    pub fn new(url: impl Into<String>, target: impl Into<PathBuf>, segments: usize) -> Result<Self, DownloadError> {
        let url = url.into();
        let parsed = Url::parse(&url).map_err(|e| DownloadError::InvalidJob(format!("bad URL '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidJob(format!(
                "unsupported scheme '{}' (expected http or https)",
                parsed.scheme()
            )));
        }
        if segments == 0 {
            return Err(DownloadError::InvalidJob("segment count must be at least 1".into()));
        }

        Ok(Self { url, target: target.into(), segments })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn segments(&self) -> usize {
        self.segments
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    ProbingSize,
    Planning,
    Fetching,
    Merging,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub size: u64,
    pub segments: usize,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

/// Drives a [`DownloadJob`] through probe, plan, concurrent fetch and merge.
pub struct Coordinator {
    job: DownloadJob,
    source: Arc<dyn RangeSource>,
    store: Arc<dyn SegmentStore>,
    cancel: CancellationToken,
    state: JobState,
}

impl Coordinator {
    pub fn new(
        job: DownloadJob,
        source: Arc<dyn RangeSource>,
        store: Arc<dyn SegmentStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self { job, source, store, cancel, state: JobState::Created }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn job(&self) -> &DownloadJob {
        &self.job
    }

    fn enter(&mut self, next: JobState) {
        debug!(from = ?self.state, to = ?next, "job state");
        self.state = next;
    }

    /// Runs the job to a terminal state. Can only be driven once.
    pub async fn run(&mut self) -> Result<DownloadReport, DownloadError> {
        if self.state != JobState::Created {
            return Err(DownloadError::InvalidJob(format!("job already ran (state {:?})", self.state)));
        }

        let result = self.drive().await;
        match &result {
            Ok(_) => self.enter(JobState::Completed),
            Err(e) => {
                warn!(error = %e, "download failed");
                self.enter(JobState::Failed);
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<DownloadReport, DownloadError> {
        let started = Instant::now();

        self.enter(JobState::ProbingSize);
        let size = self.probe_size().await?;
        info!(url = %self.job.url, size, "probed resource size");

        self.enter(JobState::Planning);
        let ranges = plan::plan_ranges(size, self.job.segments)?;
        if ranges.len() < self.job.segments {
            warn!(
                requested = self.job.segments,
                effective = ranges.len(),
                "more segments requested than bytes available; clamping"
            );
        }
        let segments = plan::handles(&ranges);
        debug!(?ranges, "planned segments");

        self.enter(JobState::Fetching);
        self.fetch_all(&segments).await?;

        self.enter(JobState::Merging);
        let bytes_written = merge::merge_segments(self.store.as_ref(), &self.job.target, &segments).await?;
        if let Err(e) = self.store.release().await {
            debug!(error = %e, "segment store not released");
        }

        Ok(DownloadReport {
            size,
            segments: segments.len(),
            bytes_written,
            elapsed: started.elapsed(),
        })
    }

    async fn probe_size(&self) -> Result<u64, DownloadError> {
        match self.source.probe(&self.job.url).await {
            Ok(Some(size)) => Ok(size),
            Ok(None) => Err(DownloadError::SizeUnknown(
                "missing, zero or unparseable Content-Length".into(),
            )),
            Err(SourceError::Status(status)) => Err(DownloadError::Remote(status)),
            Err(e) => Err(DownloadError::Probe(e)),
        }
    }

    /// Launches one task per segment and waits for every one of them, even
    /// after a failure. The first failure to arrive is the one reported,
    /// unless it is a cancellation and a sibling later failed for real.
    async fn fetch_all(&self, segments: &[SegmentHandle]) -> Result<(), DownloadError> {
        let mut join_set: JoinSet<Result<u64, DownloadError>> = JoinSet::new();

        for &handle in segments {
            let source = Arc::clone(&self.source);
            let store = Arc::clone(&self.store);
            let url = self.job.url.clone();
            let cancel = self.cancel.clone();

            join_set.spawn(async move { fetch::fetch_segment(source, store, &url, handle, cancel).await });
        }

        let mut first_error: Option<DownloadError> = None;
        let mut fetched: u64 = 0;

        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(DownloadError::Worker(e.to_string())),
            };

            match outcome {
                Ok(bytes) => fetched += bytes,
                Err(e) => {
                    debug!(error = %e, "fetch task failed");
                    let replace = match &first_error {
                        None => true,
                        Some(seen) => is_cancellation(seen) && !is_cancellation(&e),
                    };
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            if is_cancellation(&e) {
                return Err(DownloadError::Cancelled);
            }
            return Err(e);
        }

        info!(segments = segments.len(), bytes = fetched, "all segments fetched");
        Ok(())
    }
}

/// True when the job stopped because it was cancelled rather than because
/// the server or the disk failed.
pub fn is_cancellation(err: &DownloadError) -> bool {
    matches!(
        err,
        DownloadError::Cancelled | DownloadError::Fetch { cause: SegmentFailure::Cancelled, .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ByteRange;
    use crate::source::{stream_of, ByteStream, HttpSource};
    use crate::store::DiskStore;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serves `data` from memory; ranges starting at a listed offset fail
    /// with 500. Records every range requested.
    struct MemorySource {
        data: Vec<u8>,
        probe: Result<Option<u64>, StatusCode>,
        failing_starts: HashSet<u64>,
        requested: Mutex<Vec<ByteRange>>,
    }

    impl MemorySource {
        fn new(data: Vec<u8>) -> Self {
            let len = data.len() as u64;
            Self {
                data,
                probe: Ok(Some(len)),
                failing_starts: HashSet::new(),
                requested: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<ByteRange> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RangeSource for MemorySource {
        async fn probe(&self, _url: &str) -> Result<Option<u64>, SourceError> {
            self.probe.map_err(SourceError::Status)
        }

        async fn fetch(&self, _url: &str, range: ByteRange) -> Result<ByteStream, SourceError> {
            self.requested.lock().unwrap().push(range);
            // Let sibling tasks interleave.
            tokio::task::yield_now().await;
            if self.failing_starts.contains(&range.start) {
                return Err(SourceError::Status(StatusCode::INTERNAL_SERVER_ERROR));
            }
            Ok(stream_of(self.data[range.start as usize..=range.end as usize].to_vec()))
        }
    }

    /// The first segment cancels the job and then fails with 500; every
    /// other segment waits until it is cancelled.
    struct CancelThenFail {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl RangeSource for CancelThenFail {
        async fn probe(&self, _url: &str) -> Result<Option<u64>, SourceError> {
            Ok(Some(30))
        }

        async fn fetch(&self, _url: &str, range: ByteRange) -> Result<ByteStream, SourceError> {
            if range.start == 0 {
                self.cancel.cancel();
                return Err(SourceError::Status(StatusCode::INTERNAL_SERVER_ERROR));
            }
            std::future::pending().await
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn coordinator(
        temp: &TempDir,
        source: Arc<MemorySource>,
        segments: usize,
    ) -> (Coordinator, Arc<DiskStore>, PathBuf) {
        let target = temp.path().join("target.bin");
        let store = Arc::new(DiskStore::for_target(&target));
        let job = DownloadJob::new("http://example.com/file.bin", &target, segments).unwrap();
        let c = Coordinator::new(job, source, store.clone(), CancellationToken::new());
        (c, store, target)
    }

    #[test]
    fn test_job_validation() {
        assert!(DownloadJob::new("http://example.com/a", "a", 1).is_ok());
        assert!(DownloadJob::new("https://example.com/a", "a", 10).is_ok());
        assert!(matches!(DownloadJob::new("ftp://example.com/a", "a", 1), Err(DownloadError::InvalidJob(_))));
        assert!(matches!(DownloadJob::new("not a url", "a", 1), Err(DownloadError::InvalidJob(_))));
        assert!(matches!(DownloadJob::new("http://example.com/a", "a", 0), Err(DownloadError::InvalidJob(_))));
    }

    #[tokio::test]
    async fn test_ten_segments_reassemble_byte_for_byte() {
        let temp = TempDir::new().unwrap();
        let data = sample(100);
        let source = Arc::new(MemorySource::new(data.clone()));
        let (mut c, store, target) = coordinator(&temp, source.clone(), 10);

        let report = c.run().await.unwrap();

        assert_eq!(c.state(), JobState::Completed);
        assert_eq!(report.size, 100);
        assert_eq!(report.segments, 10);
        assert_eq!(report.bytes_written, 100);
        assert_eq!(std::fs::read(&target).unwrap(), data);

        let mut requested = source.requested();
        requested.sort_by_key(|r| r.start);
        assert_eq!(requested.len(), 10);
        assert_eq!(requested[0], ByteRange { start: 0, end: 9 });
        assert_eq!(requested[9], ByteRange { start: 90, end: 99 });

        // Buffers consumed, store directory gone.
        assert!(!store.dir().exists());
    }

    #[tokio::test]
    async fn test_uneven_split_reassembles() {
        let temp = TempDir::new().unwrap();
        let data = sample(25);
        let (mut c, _, target) = coordinator(&temp, Arc::new(MemorySource::new(data.clone())), 10);

        c.run().await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_more_segments_than_bytes_clamps() {
        let temp = TempDir::new().unwrap();
        let data = sample(4);
        let source = Arc::new(MemorySource::new(data.clone()));
        let (mut c, _, target) = coordinator(&temp, source.clone(), 10);

        let report = c.run().await.unwrap();
        assert_eq!(report.segments, 4);
        assert_eq!(source.requested().len(), 4);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_probe_not_found_fails_before_any_fetch() {
        let temp = TempDir::new().unwrap();
        let mut source = MemorySource::new(sample(100));
        source.probe = Err(StatusCode::NOT_FOUND);
        let source = Arc::new(source);
        let (mut c, store, target) = coordinator(&temp, source.clone(), 10);

        let err = c.run().await.unwrap_err();

        assert!(matches!(err, DownloadError::Remote(s) if s == StatusCode::NOT_FOUND));
        assert_eq!(c.state(), JobState::Failed);
        assert!(source.requested().is_empty());
        assert!(!target.exists());
        assert!(!store.dir().exists());
    }

    #[tokio::test]
    async fn test_missing_size_fails_with_size_unknown() {
        let temp = TempDir::new().unwrap();
        let mut source = MemorySource::new(sample(100));
        source.probe = Ok(None);
        let source = Arc::new(source);
        let (mut c, _, target) = coordinator(&temp, source.clone(), 4);

        let err = c.run().await.unwrap_err();
        assert!(matches!(err, DownloadError::SizeUnknown(_)));
        assert!(source.requested().is_empty());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_one_failed_segment_fails_job_and_keeps_survivors() {
        let temp = TempDir::new().unwrap();
        let mut source = MemorySource::new(sample(100));
        // Segment #4 covers bytes 40-49.
        source.failing_starts.insert(40);
        let source = Arc::new(source);
        let (mut c, store, target) = coordinator(&temp, source.clone(), 10);

        let err = c.run().await.unwrap_err();

        assert_eq!(err.segment(), Some(4));
        assert!(matches!(err, DownloadError::Fetch { index: 4, .. }));
        assert_eq!(c.state(), JobState::Failed);

        // Every task ran to completion before the job failed.
        assert_eq!(source.requested().len(), 10);

        // Merging never started.
        assert!(!target.exists());
        assert!(!merge::staging_path(&target).exists());

        for i in 0..10 {
            assert_eq!(store.contains(i).await, i != 4, "segment #{}", i);
        }
    }

    #[tokio::test]
    async fn test_single_segment_is_plain_download() {
        let temp = TempDir::new().unwrap();
        let data = sample(512);
        let source = Arc::new(MemorySource::new(data.clone()));
        let (mut c, _, target) = coordinator(&temp, source.clone(), 1);

        let report = c.run().await.unwrap();
        assert_eq!(report.segments, 1);
        assert_eq!(source.requested(), vec![ByteRange { start: 0, end: 511 }]);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_cancelled_job_reports_cancelled() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("target.bin");
        let store = Arc::new(DiskStore::for_target(&target));
        let job = DownloadJob::new("http://example.com/file.bin", &target, 3).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut c = Coordinator::new(job, Arc::new(MemorySource::new(sample(30))), store, cancel);
        let err = c.run().await.unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
        assert!(is_cancellation(&err));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_real_failure_is_not_masked_by_cancellation() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("target.bin");
        let store = Arc::new(DiskStore::for_target(&target));
        let job = DownloadJob::new("http://example.com/file.bin", &target, 3).unwrap();
        let cancel = CancellationToken::new();
        let source = Arc::new(CancelThenFail { cancel: cancel.clone() });

        let mut c = Coordinator::new(job, source, store, cancel.clone());
        let err = c.run().await.unwrap_err();

        assert!(cancel.is_cancelled());
        assert!(!is_cancellation(&err));
        match err {
            DownloadError::Fetch { index: 0, cause: SegmentFailure::Source(SourceError::Status(s)) } => {
                assert_eq!(s, StatusCode::INTERNAL_SERVER_ERROR)
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_probe() {
        let temp = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = temp.path().join("target.bin");
        let store = Arc::new(DiskStore::for_target(&target));
        let job = DownloadJob::new(format!("http://{}/file.bin", addr), &target, 4).unwrap();
        let source = HttpSource::new("sdm-test/1", Duration::from_secs(5), Duration::from_secs(5), true).unwrap();

        let mut c = Coordinator::new(job, Arc::new(source), store.clone(), CancellationToken::new());
        let err = c.run().await.unwrap_err();

        assert!(matches!(err, DownloadError::Probe(SourceError::Transport(_))), "{:?}", err);
        assert_eq!(c.state(), JobState::Failed);
        assert!(!target.exists());
        assert!(!store.dir().exists());
    }

    #[tokio::test]
    async fn test_job_runs_only_once() {
        let temp = TempDir::new().unwrap();
        let (mut c, _, _) = coordinator(&temp, Arc::new(MemorySource::new(sample(10))), 2);
        c.run().await.unwrap();
        assert!(matches!(c.run().await, Err(DownloadError::InvalidJob(_))));
        assert_eq!(c.state(), JobState::Completed);
    }
}
