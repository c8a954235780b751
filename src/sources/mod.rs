//! Source adapters for the model providers.
//!
//! Each provider implements the same capability set behind `SourceAdapter`:
//! authenticate, discover candidates, resolve a download, fetch bytes. The
//! variants differ only in how those map onto each provider's endpoints and
//! pagination scheme.

pub mod deviantart;
pub mod github;
pub mod http_client;
pub mod rate_limiter;
pub mod sketchfab;
pub mod vroid_hub;

pub use deviantart::DeviantArtSource;
pub use github::GitHubSource;
pub use http_client::{HttpClient, Payload};
pub use rate_limiter::RateLimiter;
pub use sketchfab::SketchfabSource;
pub use vroid_hub::VroidHubSource;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::models::SourceId;

/// Opaque discovery continuation token. Providers store whatever they need
/// (a next-page URL, a serialized offset) and get it back verbatim on the
/// next `discover` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(pub String);

/// One candidate model summary produced by discovery.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source: SourceId,
    pub source_model_id: String,
    pub name: String,
    pub artist: Option<String>,
    pub source_url: String,
    pub license_type: Option<String>,
    pub license_url: Option<String>,
    /// Whether the provider marks this asset as freely downloadable.
    /// `resolve_download` refuses candidates where this is false.
    pub downloadable: bool,
    /// Direct download URL, for providers that hand one out at discovery time.
    pub download_hint: Option<String>,
    /// Declared file format, when the provider states one up front.
    pub format_hint: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// Concrete download location resolved from a candidate.
#[derive(Debug, Clone)]
pub struct ResolvedDownload {
    pub url: String,
    /// Declared format of the primary file, for multi-file providers.
    pub declared_format: Option<String>,
    /// Filename declared by the provider, when known ahead of the fetch.
    pub filename: Option<String>,
}

/// One page of discovery results plus the continuation cursor.
/// `cursor = None` means the source is exhausted for these keywords.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryPage {
    pub candidates: Vec<Candidate>,
    pub cursor: Option<Cursor>,
}

/// Uniform capability set over the providers.
///
/// Adapters own their credential and HTTP state exclusively; the crawler
/// drives one adapter at a time, so methods take `&mut self`.
#[async_trait]
pub trait SourceAdapter: Send {
    fn id(&self) -> SourceId;

    /// Ensure a currently valid credential. No-op for token-less public
    /// sources. `SourceError::Auth` aborts this source for the run.
    async fn authenticate(&mut self) -> Result<(), SourceError>;

    /// Produce one page of candidate summaries matching `keywords`, bounded
    /// by `max_count`, with an updated continuation cursor. Restartable from
    /// `cursor = None` for a full re-scan.
    async fn discover(
        &mut self,
        keywords: &[String],
        max_count: usize,
        cursor: Option<Cursor>,
    ) -> Result<DiscoveryPage, SourceError>;

    /// Resolve the concrete download URL for a candidate. Fails with
    /// `SourceError::NotDownloadable` for assets the provider does not mark
    /// free/downloadable - checked before any content is fetched.
    async fn resolve_download(
        &mut self,
        candidate: &Candidate,
    ) -> Result<ResolvedDownload, SourceError>;

    /// Throttled GET of the payload at `url`. OAuth adapters refresh and
    /// retry exactly once on an auth rejection before surfacing the error.
    async fn fetch_bytes(&mut self, url: &str) -> Result<Payload, SourceError>;
}

/// Shared guard for `resolve_download` implementations.
pub(crate) fn require_downloadable(candidate: &Candidate) -> Result<(), SourceError> {
    if candidate.downloadable {
        Ok(())
    } else {
        Err(SourceError::NotDownloadable)
    }
}
