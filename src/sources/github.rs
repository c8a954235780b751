//! GitHub adapter: VRM files in public repositories.
//!
//! Works unauthenticated at GitHub's lower anonymous rate ceiling; a token
//! raises the limit. Discovery walks repository trees breadth-first through
//! the contents API, starting from a set of known VRM sample repositories
//! plus a keyword-driven repository search. The walk queue serializes into
//! the discovery cursor so a continuous run resumes mid-tree.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{
    require_downloadable, Candidate, Cursor, DiscoveryPage, HttpClient, Payload, ResolvedDownload,
    SourceAdapter,
};
use crate::error::SourceError;
use crate::models::SourceId;

const API_BASE: &str = "https://api.github.com";
const MAX_DEPTH: u32 = 3;

/// Repositories known to carry sample VRM models.
const KNOWN_REPOS: &[&str] = &["vrm-c/UniVRM", "pixiv/three-vrm", "vrm-c/vrm-specification"];

/// Directories never worth descending into.
const SKIP_DIRS: &[&str] = &["node_modules", ".git", "dist", "build", "__pycache__"];

/// One pending tree position in the breadth-first walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalkItem {
    repo: String,
    path: String,
    depth: u32,
}

/// Serialized walk state carried through the discovery cursor.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WalkCursor {
    queue: Vec<WalkItem>,
    seeded: bool,
}

impl WalkCursor {
    fn decode(cursor: Option<Cursor>) -> Self {
        cursor
            .and_then(|c| serde_json::from_str(&c.0).ok())
            .unwrap_or_default()
    }

    fn encode(&self) -> Cursor {
        Cursor(serde_json::to_string(self).expect("cursor serializes"))
    }
}

pub struct GitHubSource {
    http: HttpClient,
    token: Option<String>,
    /// Repo license strings, fetched once per repository.
    license_cache: HashMap<String, Option<String>>,
}

impl GitHubSource {
    pub fn new(http: HttpClient, token: Option<String>) -> Self {
        Self {
            http,
            token,
            license_cache: HashMap::new(),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![(
            "Accept",
            "application/vnd.github.v3+json".to_string(),
        )];
        if let Some(token) = &self.token {
            headers.push(("Authorization", format!("token {token}")));
        }
        headers
    }

    /// Seed the walk queue: known sample repos plus a keyword repo search.
    async fn seed_queue(&mut self, keywords: &[String]) -> Vec<WalkItem> {
        let mut queue: Vec<WalkItem> = KNOWN_REPOS
            .iter()
            .map(|repo| WalkItem {
                repo: repo.to_string(),
                path: String::new(),
                depth: 0,
            })
            .collect();

        if keywords.is_empty() {
            return queue;
        }

        let query = format!("{} vrm sample", keywords.join(" "));
        let url = match Url::parse_with_params(
            &format!("{API_BASE}/search/repositories"),
            &[("q", query.as_str()), ("per_page", "10"), ("sort", "stars")],
        ) {
            Ok(url) => String::from(url),
            Err(_) => return queue,
        };

        // Repo search is best-effort seeding; the known repos still get
        // walked if it fails.
        if let Ok(data) = self.http.get_json(&url, &self.headers()).await {
            if let Some(items) = data.get("items").and_then(Value::as_array) {
                for item in items {
                    if let Some(full_name) = item.get("full_name").and_then(Value::as_str) {
                        if !KNOWN_REPOS.contains(&full_name) {
                            queue.push(WalkItem {
                                repo: full_name.to_string(),
                                path: String::new(),
                                depth: 0,
                            });
                        }
                    }
                }
            }
        }

        queue
    }

    async fn repo_license(&mut self, repo: &str) -> Option<String> {
        if let Some(cached) = self.license_cache.get(repo) {
            return cached.clone();
        }

        let url = format!("{API_BASE}/repos/{repo}/license");
        let license = match self.http.get_json(&url, &self.headers()).await {
            Ok(data) => data
                .get("license")
                .and_then(|l| l.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(_) => None,
        };

        self.license_cache.insert(repo.to_string(), license.clone());
        license
    }

    /// List one directory, yielding VRM file candidates and subdirectories to
    /// queue.
    async fn list_dir(
        &mut self,
        item: &WalkItem,
        keywords: &[String],
    ) -> Result<(Vec<Candidate>, Vec<WalkItem>), SourceError> {
        let url = if item.path.is_empty() {
            format!("{API_BASE}/repos/{}/contents", item.repo)
        } else {
            format!("{API_BASE}/repos/{}/contents/{}", item.repo, item.path)
        };

        let contents = match self.http.get_json(&url, &self.headers()).await {
            Ok(Value::Array(entries)) => entries,
            // Private/moved repos and non-directory paths are not fatal to
            // the walk.
            Ok(_) => Vec::new(),
            Err(SourceError::RateLimited { retry_after }) => {
                return Err(SourceError::RateLimited { retry_after })
            }
            Err(e) => {
                debug!("Skipping {}/{}: {}", item.repo, item.path, e);
                Vec::new()
            }
        };

        let mut candidates = Vec::new();
        let mut subdirs = Vec::new();

        for entry in &contents {
            let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
            let entry_type = entry.get("type").and_then(Value::as_str).unwrap_or("");
            let entry_path = entry
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or(name)
                .to_string();

            if entry_type == "file" && name.to_lowercase().ends_with(".vrm") {
                if !matches_keywords(name, keywords) {
                    continue;
                }
                let download_url = entry
                    .get("download_url")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let license = self.repo_license(&item.repo).await;
                let owner = item.repo.split('/').next().unwrap_or("").to_string();

                candidates.push(Candidate {
                    source: SourceId::GitHub,
                    source_model_id: format!("{}/{}", item.repo, entry_path),
                    name: name.to_string(),
                    artist: (!owner.is_empty()).then_some(owner),
                    source_url: entry
                        .get("html_url")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            format!("https://github.com/{}/blob/main/{}", item.repo, entry_path)
                        }),
                    license_type: license,
                    license_url: Some(format!(
                        "https://github.com/{}/blob/main/LICENSE",
                        item.repo
                    )),
                    downloadable: download_url.is_some(),
                    download_hint: download_url,
                    format_hint: Some("vrm".to_string()),
                    thumbnail_url: None,
                });
            } else if entry_type == "dir"
                && item.depth + 1 < MAX_DEPTH
                && !SKIP_DIRS.contains(&name.to_lowercase().as_str())
            {
                subdirs.push(WalkItem {
                    repo: item.repo.clone(),
                    path: entry_path,
                    depth: item.depth + 1,
                });
            }
        }

        Ok((candidates, subdirs))
    }
}

/// Keyword filter for file names: every keyword must appear (case-insensitive)
/// somewhere in the name. No keywords matches everything.
fn matches_keywords(name: &str, keywords: &[String]) -> bool {
    let lower = name.to_lowercase();
    keywords.iter().all(|k| lower.contains(&k.to_lowercase()))
}

/// Rewrite GitHub blob page URLs to raw content URLs.
fn to_raw_url(url: &str) -> String {
    if url.contains("github.com") && url.contains("/blob/") {
        url.replace("github.com", "raw.githubusercontent.com")
            .replace("/blob/", "/")
    } else {
        url.to_string()
    }
}

#[async_trait::async_trait]
impl SourceAdapter for GitHubSource {
    fn id(&self) -> SourceId {
        SourceId::GitHub
    }

    async fn authenticate(&mut self) -> Result<(), SourceError> {
        // Public API; a token only raises the rate ceiling.
        Ok(())
    }

    async fn discover(
        &mut self,
        keywords: &[String],
        max_count: usize,
        cursor: Option<Cursor>,
    ) -> Result<DiscoveryPage, SourceError> {
        let mut walk = WalkCursor::decode(cursor);
        if !walk.seeded {
            walk.queue = self.seed_queue(keywords).await;
            walk.seeded = true;
        }

        let mut candidates = Vec::new();
        while candidates.len() < max_count && !walk.queue.is_empty() {
            let item = walk.queue.remove(0);
            let (mut found, subdirs) = self.list_dir(&item, keywords).await?;
            candidates.append(&mut found);
            walk.queue.extend(subdirs);
        }

        candidates.truncate(max_count);
        let cursor = (!walk.queue.is_empty()).then(|| walk.encode());

        Ok(DiscoveryPage { candidates, cursor })
    }

    async fn resolve_download(
        &mut self,
        candidate: &Candidate,
    ) -> Result<ResolvedDownload, SourceError> {
        require_downloadable(candidate)?;

        let url = candidate
            .download_hint
            .as_deref()
            .ok_or(SourceError::NotDownloadable)?;

        Ok(ResolvedDownload {
            url: to_raw_url(url),
            declared_format: Some("vrm".to_string()),
            filename: candidate
                .source_model_id
                .rsplit('/')
                .next()
                .map(str::to_string),
        })
    }

    async fn fetch_bytes(&mut self, url: &str) -> Result<Payload, SourceError> {
        self.http.download(url, &self.headers()).await
    }
}
