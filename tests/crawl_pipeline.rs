//! End-to-end crawl pipeline tests: a scripted source adapter driving the
//! real classifier and the real SQLite catalog.

use std::collections::HashMap;
use std::io::{Cursor as IoCursor, Write};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::sync::watch;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use vrmacquire::classify::Classifier;
use vrmacquire::crawler::{CrawlOptions, Crawler};
use vrmacquire::error::SourceError;
use vrmacquire::models::SourceId;
use vrmacquire::repository::{create_pool, ModelRepository};
use vrmacquire::sources::{
    Candidate, Cursor, DiscoveryPage, Payload, RateLimiter, ResolvedDownload, SourceAdapter,
};

fn glb_bytes() -> Vec<u8> {
    let mut bytes = b"glTF".to_vec();
    bytes.extend_from_slice(&[2, 0, 0, 0, 64, 0, 0, 0]);
    bytes
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(IoCursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(name.to_string(), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn candidate(id: &str, downloadable: bool, format_hint: Option<&str>) -> Candidate {
    Candidate {
        source: SourceId::DeviantArt,
        source_model_id: id.to_string(),
        name: format!("Model {id}"),
        artist: Some("pipeline-tester".into()),
        source_url: format!("https://example.com/{id}"),
        license_type: Some("CC0".into()),
        license_url: None,
        downloadable,
        download_hint: None,
        format_hint: format_hint.map(str::to_string),
        thumbnail_url: None,
    }
}

/// Adapter scripted with fixed candidates and canned payloads per model id.
struct ScriptedSource {
    candidates: Vec<Candidate>,
    payloads: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    fn id(&self) -> SourceId {
        SourceId::DeviantArt
    }

    async fn authenticate(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn discover(
        &mut self,
        _keywords: &[String],
        max_count: usize,
        _cursor: Option<Cursor>,
    ) -> Result<DiscoveryPage, SourceError> {
        Ok(DiscoveryPage {
            candidates: self.candidates.iter().take(max_count).cloned().collect(),
            cursor: None,
        })
    }

    async fn resolve_download(
        &mut self,
        candidate: &Candidate,
    ) -> Result<ResolvedDownload, SourceError> {
        if !candidate.downloadable {
            return Err(SourceError::NotDownloadable);
        }
        Ok(ResolvedDownload {
            url: format!("scripted://{}", candidate.source_model_id),
            declared_format: candidate.format_hint.clone(),
            filename: None,
        })
    }

    async fn fetch_bytes(&mut self, url: &str) -> Result<Payload, SourceError> {
        let id = url.strip_prefix("scripted://").unwrap_or(url);
        match self.payloads.get(id) {
            Some(bytes) => Ok(Payload {
                bytes: bytes.clone(),
                declared_len: Some(bytes.len() as u64),
                filename: None,
            }),
            None => Err(SourceError::Fetch(format!("no payload for {id}"))),
        }
    }
}

fn no_cancel() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

async fn catalog(dir: &std::path::Path) -> ModelRepository {
    let pool = create_pool(&dir.join("models.db")).unwrap();
    let repo = ModelRepository::new(pool);
    repo.ensure_schema().await.unwrap();
    repo
}

#[tokio::test]
async fn test_full_pipeline_classifies_and_catalogs() {
    let dir = tempdir().unwrap();
    let store = catalog(dir.path()).await;

    let mut payloads = HashMap::new();
    payloads.insert(
        "zip-avatar".to_string(),
        zip_bytes(&[
            ("readme.txt", b"credits".as_slice()),
            ("models/mika.vrm", glb_bytes().as_slice()),
        ]),
    );
    payloads.insert(
        "docs-only".to_string(),
        zip_bytes(&[("license.txt", b"CC0".as_slice())]),
    );
    payloads.insert("plain-glb".to_string(), glb_bytes());

    let source = ScriptedSource {
        candidates: vec![
            candidate("zip-avatar", true, Some("zip")),
            candidate("docs-only", true, Some("zip")),
            candidate("locked", false, None),
            candidate("plain-glb", true, Some("glb")),
        ],
        payloads,
    };

    let mut crawler = Crawler::new(
        vec![Box::new(source)],
        store.clone(),
        Classifier::new(dir.path()),
        RateLimiter::new(Duration::ZERO),
    );
    let opts = CrawlOptions {
        keywords: vec![],
        max_per_source: 10,
    };

    let report = crawler.crawl_once(&opts, &no_cancel()).await.unwrap();
    let summary = &report.sources[0].1;
    assert_eq!(summary.acquired, 3);
    assert_eq!(summary.not_downloadable, 1);
    assert_eq!(summary.failed, 0);
    assert!(!report.has_fatal());

    // Archive with a VRM inside: primary extracted and normalized
    let records = store.query(None, None).await.unwrap();
    assert_eq!(records.len(), 3);
    let zip_avatar = records
        .iter()
        .find(|r| r.source_model_id == "zip-avatar")
        .unwrap();
    assert_eq!(zip_avatar.file_type, "vrm");
    assert_eq!(zip_avatar.original_format.as_deref(), Some("zip"));
    assert!(zip_avatar
        .notes
        .iter()
        .any(|n| n.contains("models/mika.vrm")));
    assert!(dir.path().join(&zip_avatar.file_path).exists());

    // Archive without any 3D asset: still cataloged, flagged for manual
    // conversion
    let docs_only = records
        .iter()
        .find(|r| r.source_model_id == "docs-only")
        .unwrap();
    assert_eq!(docs_only.file_type, "zip");
    assert!(docs_only
        .notes
        .iter()
        .any(|n| n.contains("manual conversion required")));

    // Non-downloadable candidate never entered the catalog
    assert!(!store
        .exists(SourceId::DeviantArt, "locked")
        .await
        .unwrap());

    // Size reflects the stored artifact, not the declared length
    let plain = records
        .iter()
        .find(|r| r.source_model_id == "plain-glb")
        .unwrap();
    assert_eq!(plain.size_bytes, glb_bytes().len() as u64);
}

#[tokio::test]
async fn test_repeat_crawl_and_export_round_trip() {
    let dir = tempdir().unwrap();
    let store = catalog(dir.path()).await;

    let mut payloads = HashMap::new();
    payloads.insert("one".to_string(), glb_bytes());
    payloads.insert("two".to_string(), glb_bytes());

    let source = ScriptedSource {
        candidates: vec![
            candidate("one", true, Some("glb")),
            candidate("two", true, Some("glb")),
        ],
        payloads,
    };

    let mut crawler = Crawler::new(
        vec![Box::new(source)],
        store.clone(),
        Classifier::new(dir.path()),
        RateLimiter::new(Duration::ZERO),
    );
    let opts = CrawlOptions {
        keywords: vec![],
        max_per_source: 10,
    };

    let first = crawler.crawl_once(&opts, &no_cancel()).await.unwrap();
    assert_eq!(first.total_acquired(), 2);

    // An unchanged remote catalog inserts nothing the second time
    let second = crawler.crawl_once(&opts, &no_cancel()).await.unwrap();
    assert_eq!(second.total_acquired(), 0);
    assert_eq!(second.sources[0].1.duplicates, 2);
    assert_eq!(store.count().await.unwrap(), 2);

    // Export/import reproduces the record set in a fresh store
    let export_path = dir.path().join("export.json");
    store.export_json(&export_path).await.unwrap();

    let fresh_dir = tempdir().unwrap();
    let fresh = catalog(fresh_dir.path()).await;
    let imported = fresh.import_json(&export_path).await.unwrap();
    assert_eq!(imported, 2);

    let mut original = store.export().await.unwrap();
    let mut round_tripped = fresh.export().await.unwrap();
    original.sort_by(|a, b| a.source_model_id.cmp(&b.source_model_id));
    round_tripped.sort_by(|a, b| a.source_model_id.cmp(&b.source_model_id));
    assert_eq!(original, round_tripped);
}
