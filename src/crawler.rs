//! Crawl orchestration across sources.
//!
//! One crawl pass drives each adapter through discovery → fetch → classify →
//! record, in discovery order, one source to completion before the next.
//! Failures are candidate-scoped except authentication, which writes the
//! source off for the run; only store-level faults abort the whole pass.
//! Continuous mode repeats passes with a cooperative cancellation flag
//! checked between candidates and raced against the inter-batch sleep.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::classify::Classifier;
use crate::error::{SourceError, StoreError};
use crate::models::{ModelRecord, SourceId};
use crate::repository::ModelRepository;
use crate::sources::{Candidate, Cursor, Payload, RateLimiter, SourceAdapter};

/// Parameters for one crawl pass.
#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    pub keywords: Vec<String>,
    /// Stop a source after this many acquisitions in one pass.
    pub max_per_source: usize,
}

/// Per-source outcome counts for one pass.
#[derive(Debug, Clone, Default)]
pub struct SourceSummary {
    pub acquired: u64,
    pub duplicates: u64,
    pub not_downloadable: u64,
    pub failed: u64,
    /// Set when the source was aborted for the run (failed authentication or
    /// an auth rejection that survived a refresh).
    pub fatal: Option<String>,
}

/// Aggregated outcome of one crawl pass.
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub sources: Vec<(SourceId, SourceSummary)>,
}

impl CrawlReport {
    pub fn total_acquired(&self) -> u64 {
        self.sources.iter().map(|(_, s)| s.acquired).sum()
    }

    /// True when at least one source was aborted - the process exit status
    /// reflects this.
    pub fn has_fatal(&self) -> bool {
        self.sources.iter().any(|(_, s)| s.fatal.is_some())
    }
}

impl std::fmt::Display for CrawlReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, (source, s)) in self.sources.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{source}: {} acquired, {} duplicate, {} not downloadable, {} failed",
                s.acquired, s.duplicates, s.not_downloadable, s.failed
            )?;
            if let Some(reason) = &s.fatal {
                write!(f, " (aborted: {reason})")?;
            }
        }
        Ok(())
    }
}

enum Outcome {
    Acquired,
    Duplicate,
    NotDownloadable,
    Failed(String),
}

enum Abort {
    /// Authentication rejection - fatal for this source, not the run.
    Auth(String),
    /// Store fault - fatal for the run.
    Store(StoreError),
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Drives the configured source adapters against one metadata store.
pub struct Crawler {
    sources: Vec<Box<dyn SourceAdapter>>,
    store: ModelRepository,
    classifier: Classifier,
    limiter: RateLimiter,
    /// Discovery continuation per source, carried across batches within the
    /// process lifetime. Lost on restart; dedup makes the re-scan harmless.
    cursors: HashMap<SourceId, Cursor>,
}

impl Crawler {
    pub fn new(
        sources: Vec<Box<dyn SourceAdapter>>,
        store: ModelRepository,
        classifier: Classifier,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            sources,
            store,
            classifier,
            limiter,
            cursors: HashMap::new(),
        }
    }

    /// Run one crawl pass over all sources.
    pub async fn crawl_once(
        &mut self,
        opts: &CrawlOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<CrawlReport, StoreError> {
        let mut report = CrawlReport::default();
        for index in 0..self.sources.len() {
            if is_cancelled(cancel) {
                break;
            }
            let source_id = self.sources[index].id();
            info!("Crawling source: {}", source_id);
            let summary = self.crawl_source(index, opts, cancel).await?;
            report.sources.push((source_id, summary));
        }
        Ok(report)
    }

    /// Repeat crawl passes until cancelled, sleeping `interval` between
    /// batches. Returns the number of completed batches.
    pub async fn crawl_continuous(
        &mut self,
        opts: &CrawlOptions,
        interval: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<u64, StoreError> {
        let mut batches = 0u64;

        loop {
            if is_cancelled(&cancel) {
                break;
            }

            let report = self.crawl_once(opts, &cancel).await?;
            batches += 1;
            info!("Batch {} complete\n{}", batches, report);

            if is_cancelled(&cancel) {
                break;
            }

            // Race the inter-batch sleep against cancellation so shutdown
            // does not wait out the interval.
            let mut cancel_wait = cancel.clone();
            tokio::select! {
                changed = cancel_wait.changed() => {
                    if changed.is_err() || *cancel_wait.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Continuous crawl stopped after {} batch(es)", batches);
        Ok(batches)
    }

    async fn crawl_source(
        &mut self,
        index: usize,
        opts: &CrawlOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<SourceSummary, StoreError> {
        let Crawler {
            sources,
            store,
            classifier,
            limiter,
            cursors,
        } = self;
        let adapter = &mut sources[index];
        let source_id = adapter.id();
        let mut summary = SourceSummary::default();

        if let Err(e) = adapter.authenticate().await {
            warn!("Source {} failed to authenticate: {}", source_id, e);
            summary.fatal = Some(e.to_string());
            return Ok(summary);
        }

        let mut cursor = cursors.remove(&source_id);
        let mut discover_retried = false;

        'discovery: while (summary.acquired as usize) < opts.max_per_source {
            if is_cancelled(cancel) {
                break;
            }

            let want = opts.max_per_source - summary.acquired as usize;
            let page = match adapter.discover(&opts.keywords, want, cursor.clone()).await {
                Ok(page) => page,
                Err(e) => {
                    if discover_retried {
                        warn!("Discovery failed twice for {}: {}", source_id, e);
                        summary.failed += 1;
                        break;
                    }
                    discover_retried = true;
                    let backoff = retry_backoff(limiter, source_id, &e).await;
                    debug!("Discovery retry for {} after {:?}", source_id, backoff);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };
            discover_retried = false;

            if page.candidates.is_empty() && page.cursor.is_none() {
                cursor = None;
                break;
            }

            for candidate in &page.candidates {
                if is_cancelled(cancel) {
                    cursor = page.cursor;
                    break 'discovery;
                }
                if (summary.acquired as usize) >= opts.max_per_source {
                    break;
                }

                match process_candidate(adapter, store, classifier, limiter, candidate).await {
                    Ok(Outcome::Acquired) => summary.acquired += 1,
                    Ok(Outcome::Duplicate) => summary.duplicates += 1,
                    Ok(Outcome::NotDownloadable) => summary.not_downloadable += 1,
                    Ok(Outcome::Failed(reason)) => {
                        warn!(
                            "Candidate {} from {} failed: {}",
                            candidate.source_model_id, source_id, reason
                        );
                        summary.failed += 1;
                    }
                    Err(Abort::Auth(reason)) => {
                        warn!("Source {} lost authentication: {}", source_id, reason);
                        summary.fatal = Some(reason);
                        cursor = page.cursor;
                        break 'discovery;
                    }
                    Err(Abort::Store(e)) => return Err(e),
                }
            }

            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }

        if let Some(cursor) = cursor {
            cursors.insert(source_id, cursor);
        }
        Ok(summary)
    }
}

/// Backoff before a retry: at least the source's configured interval,
/// stretched to the provider's Retry-After when it sent one.
async fn retry_backoff(
    limiter: &RateLimiter,
    source: SourceId,
    error: &SourceError,
) -> Duration {
    let mut backoff = limiter.delay_for(source.as_str()).await;
    if let SourceError::RateLimited {
        retry_after: Some(secs),
    } = error
    {
        backoff = backoff.max(Duration::from_secs(*secs));
        limiter.penalize(source.as_str(), backoff).await;
    }
    backoff
}

async fn fetch_with_retry(
    adapter: &mut Box<dyn SourceAdapter>,
    limiter: &RateLimiter,
    source: SourceId,
    url: &str,
) -> Result<Payload, SourceError> {
    match adapter.fetch_bytes(url).await {
        Ok(payload) => Ok(payload),
        Err(e) if e.is_retryable() => {
            let backoff = retry_backoff(limiter, source, &e).await;
            debug!("Retrying fetch for {} after {:?} ({})", source, backoff, e);
            tokio::time::sleep(backoff).await;
            adapter.fetch_bytes(url).await
        }
        Err(e) => Err(e),
    }
}

/// Take one candidate through dedup check → resolve → fetch → classify →
/// record.
async fn process_candidate(
    adapter: &mut Box<dyn SourceAdapter>,
    store: &ModelRepository,
    classifier: &Classifier,
    limiter: &RateLimiter,
    candidate: &Candidate,
) -> Result<Outcome, Abort> {
    match store
        .exists(candidate.source, &candidate.source_model_id)
        .await
    {
        Ok(true) => {
            debug!("Skipping existing model {}", candidate.source_model_id);
            return Ok(Outcome::Duplicate);
        }
        Ok(false) => {}
        Err(e) => return Err(Abort::Store(e)),
    }

    let download = match adapter.resolve_download(candidate).await {
        Ok(download) => download,
        Err(SourceError::NotDownloadable) => return Ok(Outcome::NotDownloadable),
        Err(SourceError::Auth(reason)) => return Err(Abort::Auth(reason)),
        Err(e) => return Ok(Outcome::Failed(format!("resolve: {e}"))),
    };

    let mut payload =
        match fetch_with_retry(adapter, limiter, candidate.source, &download.url).await {
            Ok(payload) => payload,
            Err(SourceError::Auth(reason)) => return Err(Abort::Auth(reason)),
            Err(e) => return Ok(Outcome::Failed(format!("fetch: {e}"))),
        };
    if payload.filename.is_none() {
        payload.filename = download.filename.clone();
    }

    let format_hint = download
        .declared_format
        .as_deref()
        .or(candidate.format_hint.as_deref());
    let artifact = match classifier.classify(
        candidate.source,
        &candidate.source_model_id,
        &payload,
        format_hint,
    ) {
        Ok(artifact) => artifact,
        Err(e) => return Ok(Outcome::Failed(format!("classify: {e}"))),
    };

    let mut notes = artifact.notes;
    let mut thumbnail_path = None;

    // Thumbnails are best effort; a miss is a note, never a failure.
    if let Some(thumb_url) = &candidate.thumbnail_url {
        match adapter.fetch_bytes(thumb_url).await {
            Ok(thumb) => match classifier.store_thumbnail(
                candidate.source,
                &candidate.source_model_id,
                &thumb.bytes,
            ) {
                Ok(path) => thumbnail_path = Some(path),
                Err(e) => notes.push(format!("thumbnail store failed: {e}")),
            },
            Err(e) => notes.push(format!("thumbnail fetch failed: {e}")),
        }
    }

    let record = ModelRecord {
        source: candidate.source,
        source_model_id: candidate.source_model_id.clone(),
        name: candidate.name.clone(),
        artist: candidate.artist.clone(),
        source_url: candidate.source_url.clone(),
        license_type: candidate.license_type.clone(),
        license_url: candidate.license_url.clone(),
        acquired_at: Utc::now(),
        file_path: artifact.file_path,
        file_type: artifact.file_type,
        original_format: artifact.original_format,
        size_bytes: artifact.size_bytes,
        thumbnail_path,
        notes,
    };

    match store.insert(&record).await {
        Ok(()) => {
            info!(
                "Acquired {} ({}) from {}",
                record.name, record.file_type, record.source
            );
            Ok(Outcome::Acquired)
        }
        // Lost a race with another writer; the record is there, which is all
        // the crawl needs.
        Err(StoreError::DuplicateKey { .. }) => Ok(Outcome::Duplicate),
        Err(e) => Err(Abort::Store(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::create_pool;
    use crate::sources::{DiscoveryPage, ResolvedDownload};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tempfile::{tempdir, TempDir};

    fn glb_bytes() -> Vec<u8> {
        let mut bytes = b"glTF".to_vec();
        bytes.extend_from_slice(&[2, 0, 0, 0, 64, 0, 0, 0]);
        bytes
    }

    fn candidate(id: &str, downloadable: bool) -> Candidate {
        Candidate {
            source: SourceId::Sketchfab,
            source_model_id: id.to_string(),
            name: format!("Model {id}"),
            artist: Some("tester".into()),
            source_url: format!("https://example.com/{id}"),
            license_type: Some("CC0".into()),
            license_url: None,
            downloadable,
            download_hint: None,
            format_hint: Some("glb".into()),
            thumbnail_url: None,
        }
    }

    /// Scripted adapter: fixed candidate list, per-URL failure budget,
    /// records every fetched URL.
    struct MockSource {
        candidates: Vec<Candidate>,
        fetch_failures: Mutex<HashMap<String, u32>>,
        fetched_urls: Arc<Mutex<Vec<String>>>,
        auth_fails: bool,
    }

    impl MockSource {
        fn new(candidates: Vec<Candidate>) -> Self {
            Self {
                candidates,
                fetch_failures: Mutex::new(HashMap::new()),
                fetched_urls: Arc::new(Mutex::new(Vec::new())),
                auth_fails: false,
            }
        }

        fn failing_fetches(mut self, id: &str, failures: u32) -> Self {
            self.fetch_failures
                .get_mut()
                .unwrap()
                .insert(format!("mock://{id}"), failures);
            self
        }
    }

    #[async_trait]
    impl SourceAdapter for MockSource {
        fn id(&self) -> SourceId {
            SourceId::Sketchfab
        }

        async fn authenticate(&mut self) -> Result<(), SourceError> {
            if self.auth_fails {
                Err(SourceError::Auth("bad token".into()))
            } else {
                Ok(())
            }
        }

        async fn discover(
            &mut self,
            _keywords: &[String],
            _max_count: usize,
            _cursor: Option<Cursor>,
        ) -> Result<DiscoveryPage, SourceError> {
            Ok(DiscoveryPage {
                candidates: self.candidates.clone(),
                cursor: None,
            })
        }

        async fn resolve_download(
            &mut self,
            candidate: &Candidate,
        ) -> Result<ResolvedDownload, SourceError> {
            crate::sources::require_downloadable(candidate)?;
            Ok(ResolvedDownload {
                url: format!("mock://{}", candidate.source_model_id),
                declared_format: Some("glb".into()),
                filename: None,
            })
        }

        async fn fetch_bytes(&mut self, url: &str) -> Result<Payload, SourceError> {
            self.fetched_urls.lock().unwrap().push(url.to_string());
            let mut failures = self.fetch_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SourceError::Fetch("mock failure".into()));
                }
            }
            Ok(Payload {
                bytes: glb_bytes(),
                declared_len: None,
                filename: None,
            })
        }
    }

    async fn setup(sources: Vec<Box<dyn SourceAdapter>>) -> (Crawler, ModelRepository, TempDir) {
        let dir = tempdir().unwrap();
        let pool = create_pool(&dir.path().join("test.db")).unwrap();
        let store = ModelRepository::new(pool);
        store.ensure_schema().await.unwrap();
        let classifier = Classifier::new(dir.path());
        let limiter = RateLimiter::new(Duration::ZERO);
        let crawler = Crawler::new(sources, store.clone(), classifier, limiter);
        (crawler, store, dir)
    }

    fn no_cancel() -> watch::Receiver<bool> {
        // The sender drops immediately; `crawl_once` only reads the flag.
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn test_max_count_respected() {
        let mock = MockSource::new(vec![
            candidate("a", true),
            candidate("b", true),
            candidate("c", true),
        ]);
        let fetched = mock.fetched_urls.clone();
        let (mut crawler, store, _dir) = setup(vec![Box::new(mock)]).await;

        let opts = CrawlOptions {
            keywords: vec!["anime".into()],
            max_per_source: 2,
        };
        let report = crawler.crawl_once(&opts, &no_cancel()).await.unwrap();

        assert_eq!(report.total_acquired(), 2);
        assert_eq!(store.count().await.unwrap(), 2);
        // The third candidate was never touched
        let urls = fetched.lock().unwrap();
        assert!(!urls.iter().any(|u| u.contains("mock://c")));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let make = || {
            Box::new(MockSource::new(vec![
                candidate("a", true),
                candidate("b", true),
            ])) as Box<dyn SourceAdapter>
        };
        let (mut crawler, store, _dir) = setup(vec![make()]).await;
        let opts = CrawlOptions {
            keywords: vec![],
            max_per_source: 10,
        };

        let first = crawler.crawl_once(&opts, &no_cancel()).await.unwrap();
        assert_eq!(first.total_acquired(), 2);

        let second = crawler.crawl_once(&opts, &no_cancel()).await.unwrap();
        assert_eq!(second.total_acquired(), 0);
        assert_eq!(second.sources[0].1.duplicates, 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_not_downloadable_is_never_fetched() {
        let mock = MockSource::new(vec![candidate("locked", false)]);
        let fetched = mock.fetched_urls.clone();
        let (mut crawler, store, _dir) = setup(vec![Box::new(mock)]).await;

        let opts = CrawlOptions {
            keywords: vec![],
            max_per_source: 10,
        };
        let report = crawler.crawl_once(&opts, &no_cancel()).await.unwrap();

        assert_eq!(report.sources[0].1.not_downloadable, 1);
        assert_eq!(report.sources[0].1.failed, 0);
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failing_twice_counts_failed_sibling_succeeds() {
        let mock = MockSource::new(vec![candidate("bad", true), candidate("good", true)])
            .failing_fetches("bad", 2);
        let fetched = mock.fetched_urls.clone();
        let (mut crawler, store, _dir) = setup(vec![Box::new(mock)]).await;

        let opts = CrawlOptions {
            keywords: vec![],
            max_per_source: 10,
        };
        let report = crawler.crawl_once(&opts, &no_cancel()).await.unwrap();

        let summary = &report.sources[0].1;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.acquired, 1);
        assert!(!store.exists(SourceId::Sketchfab, "bad").await.unwrap());
        assert!(store.exists(SourceId::Sketchfab, "good").await.unwrap());
        // Initial attempt plus exactly one retry
        let bad_attempts = fetched
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.contains("mock://bad"))
            .count();
        assert_eq!(bad_attempts, 2);
    }

    #[tokio::test]
    async fn test_single_retry_recovers() {
        let mock =
            MockSource::new(vec![candidate("flaky", true)]).failing_fetches("flaky", 1);
        let (mut crawler, store, _dir) = setup(vec![Box::new(mock)]).await;

        let opts = CrawlOptions {
            keywords: vec![],
            max_per_source: 10,
        };
        let report = crawler.crawl_once(&opts, &no_cancel()).await.unwrap();

        assert_eq!(report.sources[0].1.acquired, 1);
        assert_eq!(report.sources[0].1.failed, 0);
        assert!(store.exists(SourceId::Sketchfab, "flaky").await.unwrap());
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_only_that_source() {
        let mut failing = MockSource::new(vec![candidate("x", true)]);
        failing.auth_fails = true;
        let healthy = MockSource::new(vec![candidate("y", true)]);

        let (mut crawler, store, _dir) =
            setup(vec![Box::new(failing), Box::new(healthy)]).await;
        let opts = CrawlOptions {
            keywords: vec![],
            max_per_source: 10,
        };
        let report = crawler.crawl_once(&opts, &no_cancel()).await.unwrap();

        assert!(report.has_fatal());
        assert!(report.sources[0].1.fatal.is_some());
        assert_eq!(report.sources[1].1.acquired, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_continuous_mode_stops_on_cancel() {
        let mock = MockSource::new(vec![candidate("a", true)]);
        let (mut crawler, _store, _dir) = setup(vec![Box::new(mock)]).await;

        let (tx, rx) = watch::channel(false);
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let opts = CrawlOptions {
            keywords: vec![],
            max_per_source: 5,
        };
        let batches = crawler
            .crawl_continuous(&opts, Duration::from_millis(5), rx)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert!(batches >= 1);
    }

    #[tokio::test]
    async fn test_acquired_record_is_classified() {
        let mock = MockSource::new(vec![candidate("m1", true)]);
        let (mut crawler, store, _dir) = setup(vec![Box::new(mock)]).await;

        let opts = CrawlOptions {
            keywords: vec![],
            max_per_source: 1,
        };
        crawler.crawl_once(&opts, &no_cancel()).await.unwrap();

        let records = store.query(Some(SourceId::Sketchfab), None).await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.file_type, "glb");
        assert_eq!(record.size_bytes, 12);
        assert!(record.notes.iter().any(|n| n.starts_with("sha256:")));
    }
}
