//! VRoid Hub API adapter (OAuth 2.0 with PKCE-issued tokens).
//!
//! Tokens come from the external authorization flow; this adapter only reads
//! them, refreshes them when expired or rejected, and persists the refresh.
//! Downloads go through the download-license endpoints: issue a license for
//! the model, then fetch through the license's download URL (which redirects
//! to a presigned CDN location).

use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use super::{
    require_downloadable, Candidate, Cursor, DiscoveryPage, HttpClient, Payload, ResolvedDownload,
    SourceAdapter,
};
use crate::credentials::{refresh_access_token, CredentialState, CredentialStore};
use crate::error::SourceError;
use crate::models::SourceId;

const API_BASE: &str = "https://hub.vroid.com/api";
const TOKEN_URL: &str = "https://hub.vroid.com/oauth/token";
const API_VERSION: &str = "11";

pub struct VroidHubSource {
    http: HttpClient,
    creds: CredentialState,
    cred_store: CredentialStore,
}

impl VroidHubSource {
    pub fn new(http: HttpClient, creds: CredentialState, cred_store: CredentialStore) -> Self {
        Self {
            http,
            creds,
            cred_store,
        }
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Authorization", format!("Bearer {}", self.creds.access_token)),
            ("X-Api-Version", API_VERSION.to_string()),
        ]
    }

    async fn refresh(&mut self) -> Result<(), SourceError> {
        let extra = [("X-Api-Version", API_VERSION.to_string())];
        refresh_access_token(
            &self.http,
            TOKEN_URL,
            &extra,
            &mut self.creds,
            &self.cred_store,
            SourceId::VroidHub,
        )
        .await
    }

    fn search_url(keywords: &[String], count: usize) -> Result<String, SourceError> {
        let keyword = if keywords.is_empty() {
            "vrm".to_string()
        } else {
            keywords.join(" ")
        };
        let count = count.clamp(1, 100).to_string();
        let url = Url::parse_with_params(
            &format!("{API_BASE}/search/character_models"),
            &[
                ("keyword", keyword.as_str()),
                ("count", count.as_str()),
                ("is_downloadable", "true"),
            ],
        )
        .map_err(|e| SourceError::Fetch(format!("bad search URL: {e}")))?;
        Ok(url.into())
    }
}

/// Parse one character-model entry into a candidate summary.
fn parse_model(model: &Value) -> Option<Candidate> {
    let model_id = match model.get("id")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let character = model.get("character").cloned().unwrap_or(Value::Null);
    let user = character
        .get("user")
        .filter(|u| !u.is_null())
        .or_else(|| model.get("user"))
        .cloned()
        .unwrap_or(Value::Null);

    // VRoid Hub reports per-model usage conditions; summarize the permissive
    // ones into the recorded license string.
    let license = model.get("license").cloned().unwrap_or(Value::Null);
    let mut license_parts = Vec::new();
    if license.get("modification").and_then(Value::as_str) == Some("allow") {
        license_parts.push("modification allowed");
    }
    if license.get("redistribution").and_then(Value::as_str) == Some("allow") {
        license_parts.push("redistribution allowed");
    }
    if matches!(
        license.get("personal_commercial_use").and_then(Value::as_str),
        Some("allow") | Some("profit") | Some("nonprofit")
    ) {
        license_parts.push("personal commercial use");
    }
    let license_str = if license_parts.is_empty() {
        "VRoid Hub License".to_string()
    } else {
        format!("VRoid Hub License ({})", license_parts.join(", "))
    };

    let char_id = character.get("id").and_then(Value::as_str).unwrap_or("");
    let source_url = if char_id.is_empty() {
        format!("https://hub.vroid.com/characters/{model_id}")
    } else {
        format!("https://hub.vroid.com/characters/{char_id}/models/{model_id}")
    };

    // Prefer the w300 portrait rendition, falling back to the original.
    let portrait = model.get("portrait_image").cloned().unwrap_or(Value::Null);
    let thumbnail_url = portrait
        .get("w300")
        .and_then(|p| p.get("url"))
        .and_then(Value::as_str)
        .or_else(|| {
            portrait
                .get("original")
                .and_then(|p| p.get("url"))
                .and_then(Value::as_str)
        })
        .map(str::to_string);

    let name = character
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| model.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("Model {model_id}"));

    Some(Candidate {
        source: SourceId::VroidHub,
        name,
        artist: user.get("name").and_then(Value::as_str).map(str::to_string),
        source_url,
        license_type: Some(license_str),
        license_url: Some("https://hub.vroid.com/license".to_string()),
        downloadable: model
            .get("is_downloadable")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        download_hint: None,
        format_hint: Some("vrm".to_string()),
        thumbnail_url,
        source_model_id: model_id,
    })
}

/// The API hands back relative next-page hrefs; absolutize them.
fn absolutize_next(href: &str) -> String {
    if href.starts_with('/') {
        format!("https://hub.vroid.com{href}")
    } else {
        href.to_string()
    }
}

#[async_trait::async_trait]
impl SourceAdapter for VroidHubSource {
    fn id(&self) -> SourceId {
        SourceId::VroidHub
    }

    async fn authenticate(&mut self) -> Result<(), SourceError> {
        if !self.creds.has_access_token() && !self.creds.can_refresh() {
            return Err(SourceError::Auth(
                "no VRoid Hub credentials stored; run the authorization flow first".to_string(),
            ));
        }
        if !self.creds.has_access_token() || self.creds.is_expired() {
            debug!("VRoid Hub token missing or expired, refreshing");
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
        let url = match cursor {
            Some(Cursor(next)) => next,
            None => Self::search_url(keywords, max_count)?,
        };

        let data = match self.http.get_json(&url, &self.auth_headers()).await {
            Err(SourceError::Auth(_)) => {
                self.refresh().await?;
                self.http.get_json(&url, &self.auth_headers()).await?
            }
            other => other?,
        };

        let models = data
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let candidates: Vec<Candidate> = models
            .iter()
            .filter_map(parse_model)
            .take(max_count)
            .collect();

        let cursor = data
            .get("_links")
            .and_then(|l| l.get("next"))
            .and_then(|n| n.get("href"))
            .and_then(Value::as_str)
            .filter(|_| !models.is_empty())
            .map(|href| Cursor(absolutize_next(href)));

        Ok(DiscoveryPage { candidates, cursor })
    }

    async fn resolve_download(
        &mut self,
        candidate: &Candidate,
    ) -> Result<ResolvedDownload, SourceError> {
        require_downloadable(candidate)?;

        // Issue a download license for this model; the license id gives us
        // the concrete download endpoint.
        let body = json!({ "character_model_id": candidate.source_model_id });
        let url = format!("{API_BASE}/download_licenses");
        let response = match self.http.post_json(&url, &self.auth_headers(), &body).await {
            Err(SourceError::Auth(_)) => {
                self.refresh().await?;
                self.http.post_json(&url, &self.auth_headers(), &body).await?
            }
            other => other?,
        };

        let license_id = response
            .get("data")
            .and_then(|d| d.get("id"))
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| {
                SourceError::Fetch(format!(
                    "no download license issued for model {}",
                    candidate.source_model_id
                ))
            })?;
        debug!("Obtained download license {}", license_id);

        Ok(ResolvedDownload {
            url: format!("{API_BASE}/download_licenses/{license_id}/download"),
            declared_format: Some("vrm".to_string()),
            filename: None,
        })
    }

    async fn fetch_bytes(&mut self, url: &str) -> Result<Payload, SourceError> {
        match self.http.download(url, &self.auth_headers()).await {
            Err(SourceError::Auth(reason)) => {
                warn!("VRoid Hub rejected token ({}), refreshing once", reason);
                self.refresh().await?;
                self.http.download(url, &self.auth_headers()).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_model_license_summary() {
        let model = json!({
            "id": 12345,
            "is_downloadable": true,
            "character": {"id": "c1", "name": "Mika", "user": {"name": "artist9"}},
            "license": {
                "modification": "allow",
                "redistribution": "disallow",
                "personal_commercial_use": "profit"
            },
            "portrait_image": {"w300": {"url": "https://img/300.png"}}
        });

        let candidate = parse_model(&model).unwrap();
        assert_eq!(candidate.source_model_id, "12345");
        assert_eq!(candidate.name, "Mika");
        assert_eq!(candidate.artist.as_deref(), Some("artist9"));
        assert!(candidate.downloadable);
        let license = candidate.license_type.unwrap();
        assert!(license.contains("modification allowed"));
        assert!(license.contains("personal commercial use"));
        assert!(!license.contains("redistribution"));
        assert_eq!(
            candidate.source_url,
            "https://hub.vroid.com/characters/c1/models/12345"
        );
    }

    #[test]
    fn test_parse_model_not_downloadable() {
        let model = json!({"id": "99", "is_downloadable": false, "character": {}});
        let candidate = parse_model(&model).unwrap();
        assert!(!candidate.downloadable);
    }

    #[test]
    fn test_absolutize_next() {
        assert_eq!(
            absolutize_next("/api/search/character_models?page=2"),
            "https://hub.vroid.com/api/search/character_models?page=2"
        );
        assert_eq!(
            absolutize_next("https://hub.vroid.com/api/x"),
            "https://hub.vroid.com/api/x"
        );
    }
}
