//! OAuth credential state and its file-backed persistence.
//!
//! Token acquisition (the browser authorization flow) happens outside this
//! crate; adapters only read stored credentials and refresh them in place
//! when expired or rejected, writing the result back through the store.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SourceError;
use crate::models::SourceId;
use crate::sources::HttpClient;

/// Stored OAuth state for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialState {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialState {
    /// True when the access token is past its recorded expiry.
    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if t <= Utc::now())
    }

    /// True when there is a token to present at all.
    pub fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn can_refresh(&self) -> bool {
        !self.refresh_token.is_empty() && !self.client_id.is_empty()
    }
}

/// Token endpoint response shape shared by the OAuth providers.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Fold the refreshed tokens into existing state. Providers that rotate
    /// refresh tokens send a new one; those that don't keep the old.
    pub fn apply_to(self, state: &mut CredentialState) {
        state.access_token = self.access_token;
        if let Some(refresh) = self.refresh_token {
            state.refresh_token = refresh;
        }
        state.expires_at = self.expires_in.map(|secs| Utc::now() + Duration::seconds(secs));
    }
}

/// File-backed credential persistence under `<data_root>/credentials/`.
///
/// One JSON file per source. The external authorization flow writes these;
/// this crate reads them and writes back refreshed tokens.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, source: SourceId) -> PathBuf {
        self.dir.join(format!("{}.json", source.as_str()))
    }

    /// Load stored credentials for a source, if any exist.
    pub fn load(&self, source: SourceId) -> anyhow::Result<Option<CredentialState>> {
        let path = self.path_for(source);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let state = serde_json::from_str(&raw)?;
        Ok(Some(state))
    }

    /// Persist credentials for a source, creating the directory if needed.
    pub fn save(&self, source: SourceId, state: &CredentialState) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(source);
        fs::write(&path, serde_json::to_string_pretty(state)?)?;
        info!("Saved credentials for {} to {}", source, path.display());
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Run a refresh-token grant against `token_url`, update `state` in place,
/// and persist the result.
///
/// Any failure along the way maps to `SourceError::Auth`: a source whose
/// credentials cannot be refreshed is done for the run.
pub async fn refresh_access_token(
    http: &HttpClient,
    token_url: &str,
    extra_headers: &[(&str, String)],
    state: &mut CredentialState,
    store: &CredentialStore,
    source: SourceId,
) -> Result<(), SourceError> {
    if !state.can_refresh() {
        return Err(SourceError::Auth(format!(
            "no refresh token stored for {source}"
        )));
    }

    let form = [
        ("grant_type", "refresh_token"),
        ("client_id", state.client_id.as_str()),
        ("client_secret", state.client_secret.as_str()),
        ("refresh_token", state.refresh_token.as_str()),
    ];

    let body = http
        .post_form(token_url, extra_headers, &form)
        .await
        .map_err(|e| SourceError::Auth(format!("token refresh failed: {e}")))?;

    let tokens: TokenResponse = serde_json::from_value(body)
        .map_err(|e| SourceError::Auth(format!("malformed token response: {e}")))?;
    tokens.apply_to(state);

    store
        .save(source, state)
        .map_err(|e| SourceError::Auth(format!("could not persist refreshed tokens: {e}")))?;

    info!("Refreshed access token for {}", source);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials"));

        let state = CredentialState {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            access_token: "tok".into(),
            refresh_token: "refresh".into(),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        };
        store.save(SourceId::VroidHub, &state).unwrap();

        let loaded = store.load(SourceId::VroidHub).unwrap().unwrap();
        assert_eq!(loaded.access_token, "tok");
        assert_eq!(loaded.refresh_token, "refresh");
        assert!(!loaded.is_expired());

        // Other sources are unaffected
        assert!(store.load(SourceId::Sketchfab).unwrap().is_none());
    }

    #[test]
    fn test_expiry() {
        let mut state = CredentialState {
            access_token: "tok".into(),
            ..Default::default()
        };
        assert!(!state.is_expired());

        state.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(state.is_expired());
    }

    #[test]
    fn test_token_response_keeps_old_refresh_token() {
        let mut state = CredentialState {
            refresh_token: "old-refresh".into(),
            ..Default::default()
        };
        let response = TokenResponse {
            access_token: "new-access".into(),
            refresh_token: None,
            expires_in: Some(3600),
        };
        response.apply_to(&mut state);
        assert_eq!(state.access_token, "new-access");
        assert_eq!(state.refresh_token, "old-refresh");
        assert!(state.expires_at.is_some());
    }
}
