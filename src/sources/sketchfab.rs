//! Sketchfab Data API v3 adapter (static API token).
//!
//! Search runs with `downloadable=true`; candidates additionally pass a free
//! Creative Commons license allowlist before being marked downloadable.
//! Download resolution prefers the GLB archive, falling back to the glTF zip.

use serde_json::Value;
use url::Url;

use super::{
    require_downloadable, Candidate, Cursor, DiscoveryPage, HttpClient, Payload, ResolvedDownload,
    SourceAdapter,
};
use crate::error::SourceError;
use crate::models::SourceId;

const API_BASE: &str = "https://api.sketchfab.com/v3";

/// Free Creative Commons license slugs accepted for acquisition.
const FREE_LICENSES: &[&str] = &[
    "cc0",
    "cc-by",
    "cc-by-sa",
    "cc-by-nd",
    "cc-by-nc",
    "cc-by-nc-sa",
    "cc-by-nc-nd",
];

pub struct SketchfabSource {
    http: HttpClient,
    api_token: String,
}

impl SketchfabSource {
    pub fn new(http: HttpClient, api_token: String) -> Self {
        Self { http, api_token }
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        vec![("Authorization", format!("Token {}", self.api_token))]
    }

    fn search_url(keywords: &[String], count: usize) -> Result<String, SourceError> {
        let query = if keywords.is_empty() {
            "vrm avatar".to_string()
        } else {
            keywords.join(" ")
        };
        let count = count.clamp(1, 24).to_string();
        let url = Url::parse_with_params(
            &format!("{API_BASE}/search"),
            &[
                ("type", "models"),
                ("q", query.as_str()),
                ("downloadable", "true"),
                ("count", count.as_str()),
            ],
        )
        .map_err(|e| SourceError::Fetch(format!("bad search URL: {e}")))?;
        Ok(url.into())
    }
}

/// Parse one search result into a candidate summary.
fn parse_model(item: &Value) -> Option<Candidate> {
    let model_id = item.get("uid")?.as_str()?.to_string();
    let license = item.get("license").cloned().unwrap_or(Value::Null);
    let user = item.get("user").cloned().unwrap_or(Value::Null);

    let license_slug = license
        .get("slug")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let is_free_license = license_slug.is_empty() || FREE_LICENSES.contains(&license_slug);

    let thumbnail_url = item
        .get("thumbnails")
        .and_then(|t| t.get("images"))
        .and_then(Value::as_array)
        .and_then(|images| {
            images
                .iter()
                .find(|img| img.get("width").and_then(Value::as_u64).unwrap_or(0) >= 200)
                .or_else(|| images.first())
        })
        .and_then(|img| img.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let artist = user
        .get("displayName")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| user.get("username").and_then(Value::as_str))
        .map(str::to_string);

    Some(Candidate {
        source: SourceId::Sketchfab,
        name: item
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Model {model_id}")),
        artist,
        source_url: item
            .get("viewerUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://sketchfab.com/3d-models/{model_id}")),
        license_type: Some(
            license
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or("Sketchfab Standard")
                .to_string(),
        ),
        license_url: Some(
            license
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or("https://sketchfab.com/licenses")
                .to_string(),
        ),
        downloadable: item
            .get("isDownloadable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            && is_free_license,
        download_hint: None,
        format_hint: Some("glb".to_string()),
        thumbnail_url,
        source_model_id: model_id,
    })
}

#[async_trait::async_trait]
impl SourceAdapter for SketchfabSource {
    fn id(&self) -> SourceId {
        SourceId::Sketchfab
    }

    async fn authenticate(&mut self) -> Result<(), SourceError> {
        if self.api_token.is_empty() {
            return Err(SourceError::Auth(
                "Sketchfab API token is required".to_string(),
            ));
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

        let data = self.http.get_json(&url, &self.auth_headers()).await?;
        let results = data
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let candidates: Vec<Candidate> = results
            .iter()
            .filter_map(parse_model)
            .take(max_count)
            .collect();

        // The API hands back an absolute next-page URL with all params baked in.
        let cursor = data
            .get("next")
            .and_then(Value::as_str)
            .filter(|_| !results.is_empty())
            .map(|next| Cursor(next.to_string()));

        Ok(DiscoveryPage { candidates, cursor })
    }

    async fn resolve_download(
        &mut self,
        candidate: &Candidate,
    ) -> Result<ResolvedDownload, SourceError> {
        require_downloadable(candidate)?;

        let url = format!("{API_BASE}/models/{}/download", candidate.source_model_id);
        let data = self.http.get_json(&url, &self.auth_headers()).await?;

        // Prefer the single-file GLB; glTF arrives as a zip with textures.
        if let Some(glb_url) = data
            .get("glb")
            .and_then(|g| g.get("url"))
            .and_then(Value::as_str)
        {
            return Ok(ResolvedDownload {
                url: glb_url.to_string(),
                declared_format: Some("glb".to_string()),
                filename: None,
            });
        }
        if let Some(gltf_url) = data
            .get("gltf")
            .and_then(|g| g.get("url"))
            .and_then(Value::as_str)
        {
            return Ok(ResolvedDownload {
                url: gltf_url.to_string(),
                declared_format: Some("zip".to_string()),
                filename: None,
            });
        }

        Err(SourceError::Fetch(format!(
            "no download URL for model {}",
            candidate.source_model_id
        )))
    }

    async fn fetch_bytes(&mut self, url: &str) -> Result<Payload, SourceError> {
        // Download URLs are presigned CDN links; auth headers must not leak.
        self.http.download(url, &[]).await
    }
}
