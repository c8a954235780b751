//! Throttled HTTP client shared by the source adapters.
//!
//! Every request waits on the rate limiter first and carries a bounded
//! timeout. Status codes map into the adapter error taxonomy here so the
//! per-provider code only deals with payload shapes.

use std::time::Duration;

use reqwest::header::{CONTENT_DISPOSITION, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use super::rate_limiter::RateLimiter;
use crate::error::SourceError;
use crate::models::SourceId;

const USER_AGENT: &str = "VRMAcquire/0.4 (github.com/monokrome/vrmacquire)";

/// Raw download result.
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Vec<u8>,
    /// Content-Length as declared by the server, when present. The classifier
    /// never trusts this for the cataloged size.
    pub declared_len: Option<u64>,
    /// Filename from Content-Disposition, when the server sent one.
    pub filename: Option<String>,
}

/// HTTP client bound to one source's rate-limit lane.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    source_id: SourceId,
    rate_limiter: RateLimiter,
}

impl HttpClient {
    pub fn new(
        source_id: SourceId,
        timeout: Duration,
        rate_limiter: RateLimiter,
    ) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            source_id,
            rate_limiter,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Throttled GET returning the raw response after status mapping.
    pub async fn get(
        &self,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<Response, SourceError> {
        self.rate_limiter.acquire(self.source_id.as_str()).await;

        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        let response = request.send().await?;
        Self::check_status(&response)?;
        Ok(response)
    }

    /// Throttled GET with a JSON body.
    pub async fn get_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<Value, SourceError> {
        let response = self.get(url, headers).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| SourceError::Fetch(format!("unexpected response body: {e}")))
    }

    /// Throttled POST with a JSON body, returning the JSON response.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &Value,
    ) -> Result<Value, SourceError> {
        self.rate_limiter.acquire(self.source_id.as_str()).await;

        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        let response = request.send().await?;
        Self::check_status(&response)?;
        response
            .json::<Value>()
            .await
            .map_err(|e| SourceError::Fetch(format!("unexpected response body: {e}")))
    }

    /// Throttled form POST (token endpoints), returning the JSON response.
    pub async fn post_form(
        &self,
        url: &str,
        headers: &[(&str, String)],
        form: &[(&str, &str)],
    ) -> Result<Value, SourceError> {
        self.rate_limiter.acquire(self.source_id.as_str()).await;

        let mut request = self.client.post(url).form(form);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        let response = request.send().await?;
        Self::check_status(&response)?;
        response
            .json::<Value>()
            .await
            .map_err(|e| SourceError::Fetch(format!("unexpected response body: {e}")))
    }

    /// Throttled download of a full payload.
    pub async fn download(
        &self,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<Payload, SourceError> {
        let response = self.get(url, headers).await?;

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition_filename);
        let declared_len = response.content_length();

        let bytes = response.bytes().await?.to_vec();
        Ok(Payload {
            bytes,
            declared_len,
            filename,
        })
    }

    /// Map HTTP status into the adapter error taxonomy.
    fn check_status(response: &Response) -> Result<(), SourceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                Err(SourceError::RateLimited { retry_after })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(SourceError::Auth(format!("HTTP {}", status.as_u16())))
            }
            _ => Err(SourceError::Fetch(format!("HTTP {}", status.as_u16()))),
        }
    }
}

/// Parse filename from a Content-Disposition header value.
/// Handles both `filename="name.vrm"` and `filename*=UTF-8''name.vrm`.
pub fn parse_content_disposition_filename(header: &str) -> Option<String> {
    // RFC 5987 encoded form takes precedence
    if let Some(start) = header.find("filename*=") {
        let rest = &header[start + 10..];
        if let Some(quote_start) = rest.find("''") {
            let encoded = rest[quote_start + 2..].split([';', ' ']).next()?;
            if let Ok(decoded) = urlencoding::decode(encoded) {
                let filename = decoded.trim().to_string();
                if !filename.is_empty() {
                    return Some(filename);
                }
            }
        }
    }

    if let Some(start) = header.find("filename=") {
        let rest = &header[start + 9..];
        let filename = if let Some(quoted) = rest.strip_prefix('"') {
            quoted.split('"').next()
        } else {
            rest.split([';', ' ']).next()
        };

        if let Some(name) = filename {
            let name = name.trim().to_string();
            if !name.is_empty() {
                return Some(name);
            }
        }
    }

    None
}
