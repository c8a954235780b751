//! Error taxonomy for the acquisition pipeline.
//!
//! Source-level errors (`SourceError`) are produced by adapters; the crawler
//! decides their scope. `Auth` aborts the source for the run, everything else
//! is candidate-scoped. Store errors carry the dedup violation as a distinct
//! variant so callers can treat it as an ordinary skip.

use thiserror::Error;

/// Errors surfaced by source adapters.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Credentials are absent, invalid, or could not be refreshed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The provider does not mark this asset as freely downloadable.
    #[error("asset is not marked downloadable")]
    NotDownloadable,

    /// Network or HTTP-level failure: non-2xx status, timeout, transport.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Provider-reported throttling (HTTP 429).
    #[error("rate limited by provider")]
    RateLimited {
        /// Seconds from the Retry-After header, when the provider sent one.
        retry_after: Option<u64>,
    },
}

impl SourceError {
    /// Whether the crawler should retry the fetch once before recording a
    /// candidate failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Fetch(_) | SourceError::RateLimited { .. })
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Fetch(format!("request timed out: {err}"))
        } else {
            SourceError::Fetch(err.to_string())
        }
    }
}

/// Storage I/O fault while writing or extracting a downloaded artifact.
///
/// Classification never fails on "can't identify format" - that becomes a
/// note on the record instead.
#[derive(Debug, Error)]
#[error("artifact storage failed: {0}")]
pub struct ClassifyError(#[from] std::io::Error);

/// Errors from the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The `(source, source_model_id)` pair is already cataloged.
    #[error("record already exists for ({source_name}, {source_model_id})")]
    DuplicateKey {
        source_name: String,
        source_model_id: String,
    },

    /// Any other database failure. Run-fatal when it escapes the crawler.
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}
