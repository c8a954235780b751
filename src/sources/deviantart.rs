//! DeviantArt API adapter (OAuth 2.0).
//!
//! Discovery browses deviation tags with offset pagination, walking a list of
//! 3D-model tags (user keywords first). The cursor serializes the current tag
//! index and offset so a continuous run picks up exactly where it stopped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::{
    require_downloadable, Candidate, Cursor, DiscoveryPage, HttpClient, Payload, ResolvedDownload,
    SourceAdapter,
};
use crate::credentials::{refresh_access_token, CredentialState, CredentialStore};
use crate::error::SourceError;
use crate::models::SourceId;

const API_BASE: &str = "https://www.deviantart.com/api/v1/oauth2";
const TOKEN_URL: &str = "https://www.deviantart.com/oauth2/token";
const PAGE_LIMIT: usize = 24;

/// Tags browsed when the user supplies no keywords (DeviantArt tags carry no
/// spaces).
const DEFAULT_TAGS: &[&str] = &[
    "3Dmodel",
    "VRMmodel",
    "VRChat",
    "3Dcharacter",
    "3Davatar",
    "VRoid",
    "charactermodel",
    "freemodel",
];

/// Discovery position: which tag, and how far into its result stream.
#[derive(Debug, Serialize, Deserialize, Default)]
struct TagCursor {
    tag_index: usize,
    offset: u64,
}

impl TagCursor {
    fn decode(cursor: Option<Cursor>) -> Self {
        cursor
            .and_then(|c| serde_json::from_str(&c.0).ok())
            .unwrap_or_default()
    }

    fn encode(&self) -> Cursor {
        Cursor(serde_json::to_string(self).expect("cursor serializes"))
    }
}

pub struct DeviantArtSource {
    http: HttpClient,
    creds: CredentialState,
    cred_store: CredentialStore,
}

impl DeviantArtSource {
    pub fn new(http: HttpClient, creds: CredentialState, cred_store: CredentialStore) -> Self {
        Self {
            http,
            creds,
            cred_store,
        }
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        vec![("Authorization", format!("Bearer {}", self.creds.access_token))]
    }

    async fn refresh(&mut self) -> Result<(), SourceError> {
        refresh_access_token(
            &self.http,
            TOKEN_URL,
            &[],
            &mut self.creds,
            &self.cred_store,
            SourceId::DeviantArt,
        )
        .await
    }

    fn tags(keywords: &[String]) -> Vec<String> {
        let mut tags: Vec<String> = keywords.to_vec();
        tags.extend(DEFAULT_TAGS.iter().map(|t| t.to_string()));
        tags
    }

    fn browse_url(tag: &str, offset: u64, limit: usize) -> Result<String, SourceError> {
        let offset = offset.to_string();
        let limit = limit.clamp(1, PAGE_LIMIT).to_string();
        let url = Url::parse_with_params(
            &format!("{API_BASE}/browse/tags"),
            &[
                ("tag", tag),
                ("offset", offset.as_str()),
                ("limit", limit.as_str()),
                ("mature_content", "true"),
            ],
        )
        .map_err(|e| SourceError::Fetch(format!("bad browse URL: {e}")))?;
        Ok(url.into())
    }

    async fn get_json_refreshing(&mut self, url: &str) -> Result<Value, SourceError> {
        match self.http.get_json(url, &self.auth_headers()).await {
            Err(SourceError::Auth(reason)) => {
                warn!("DeviantArt rejected token ({}), refreshing once", reason);
                self.refresh().await?;
                self.http.get_json(url, &self.auth_headers()).await
            }
            other => other,
        }
    }
}

/// Parse one deviation into a candidate summary.
fn parse_deviation(deviation: &Value) -> Option<Candidate> {
    let deviation_id = deviation.get("deviationid")?.as_str()?.to_string();
    let author = deviation.get("author").cloned().unwrap_or(Value::Null);
    let content = deviation.get("content").cloned().unwrap_or(Value::Null);

    // Prefer the content rendition for the thumbnail, falling back to the
    // largest thumb.
    let thumbnail_url = content
        .get("src")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            deviation
                .get("thumbs")
                .and_then(Value::as_array)
                .and_then(|thumbs| thumbs.last())
                .and_then(|t| t.get("src"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    Some(Candidate {
        source: SourceId::DeviantArt,
        name: deviation
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Deviation {deviation_id}")),
        artist: author
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string),
        source_url: deviation
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("https://www.deviantart.com/deviation/{deviation_id}")
            }),
        license_type: Some("DeviantArt Terms".to_string()),
        license_url: Some("https://www.deviantart.com/about/policy/submission/".to_string()),
        downloadable: deviation
            .get("is_downloadable")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        download_hint: None,
        format_hint: None,
        thumbnail_url,
        source_model_id: deviation_id,
    })
}

#[async_trait::async_trait]
impl SourceAdapter for DeviantArtSource {
    fn id(&self) -> SourceId {
        SourceId::DeviantArt
    }

    async fn authenticate(&mut self) -> Result<(), SourceError> {
        if !self.creds.has_access_token() && !self.creds.can_refresh() {
            return Err(SourceError::Auth(
                "no DeviantArt credentials stored; run the authorization flow first".to_string(),
            ));
        }
        if !self.creds.has_access_token() || self.creds.is_expired() {
            debug!("DeviantArt token missing or expired, refreshing");
            self.refresh().await?;
        }
        Ok(())
    }

    async fn discover(
        &mut self,
        keywords: &[String],
        max_count: usize,
        cursor: Option<Cursor>,
    ) -> Result<DiscoveryPage, SourceError> {
        let tags = Self::tags(keywords);
        let mut position = TagCursor::decode(cursor);
        let mut candidates = Vec::new();

        while candidates.len() < max_count && position.tag_index < tags.len() {
            let tag = &tags[position.tag_index];
            let url = Self::browse_url(tag, position.offset, max_count - candidates.len())?;
            let data = self.get_json_refreshing(&url).await?;

            let results = data
                .get("results")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            candidates.extend(results.iter().filter_map(parse_deviation));

            if results.is_empty() {
                position.tag_index += 1;
                position.offset = 0;
                continue;
            }

            if data.get("has_more").and_then(Value::as_bool).unwrap_or(false) {
                position.offset = data
                    .get("next_offset")
                    .and_then(Value::as_u64)
                    .unwrap_or(position.offset + results.len() as u64);
            } else {
                // This tag is exhausted; move to the next one from the top.
                position.tag_index += 1;
                position.offset = 0;
            }
        }

        candidates.truncate(max_count);
        let cursor = if position.tag_index < tags.len() {
            Some(position.encode())
        } else {
            None
        };

        Ok(DiscoveryPage { candidates, cursor })
    }

    async fn resolve_download(
        &mut self,
        candidate: &Candidate,
    ) -> Result<ResolvedDownload, SourceError> {
        require_downloadable(candidate)?;

        let url = format!(
            "{API_BASE}/deviation/download/{}",
            candidate.source_model_id
        );
        let data = self.get_json_refreshing(&url).await?;

        let src = data
            .get("src")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SourceError::Fetch(format!(
                    "no download URL for deviation {}",
                    candidate.source_model_id
                ))
            })?
            .to_string();

        let filename = data
            .get("filename")
            .and_then(Value::as_str)
            .map(str::to_string);
        let declared_format = filename
            .as_deref()
            .and_then(|f| f.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());

        Ok(ResolvedDownload {
            url: src,
            declared_format,
            filename,
        })
    }

    async fn fetch_bytes(&mut self, url: &str) -> Result<Payload, SourceError> {
        // Download src URLs are short-lived signed links; no auth header.
        match self.http.download(url, &[]).await {
            Err(SourceError::Auth(reason)) => {
                warn!("DeviantArt rejected download ({}), refreshing once", reason);
                self.refresh().await?;
                self.http.download(url, &[]).await
            }
            other => other,
        }
    }
}
