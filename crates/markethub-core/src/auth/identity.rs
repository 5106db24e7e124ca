//! Identity providers that hand out short-lived bearer tokens.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::ApiError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("No authenticated identity")]
    NoSession,

    #[error("Identity provider rejected the request: {0}")]
    Rejected(String),

    #[error("Could not reach identity provider: {0}")]
    Unreachable(String),
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::NoSession | IdentityError::Rejected(_) => {
                ApiError::TokenAcquisitionFailed(err.to_string())
            }
            IdentityError::Unreachable(msg) => ApiError::NetworkFailure(msg),
        }
    }
}

/// Source of bearer tokens.
///
/// With `force_refresh` false a provider may answer from its own cache; with
/// `force_refresh` true it must obtain a new token from the network.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn acquire_token(&self, force_refresh: bool) -> Result<String, IdentityError>;

    /// Hand over a solved verification challenge before sign-in. Providers
    /// that never ask for one accept anything.
    async fn submit_challenge(&self, _proof: &str) -> Result<(), IdentityError> {
        Ok(())
    }
}

/// Always returns the same token. Useful for service accounts and scripts.
pub struct StaticIdentity {
    token: Option<String>,
}

impl StaticIdentity {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// A provider with nobody signed in.
    pub fn signed_out() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn acquire_token(&self, _force_refresh: bool) -> Result<String, IdentityError> {
        self.token.clone().ok_or(IdentityError::NoSession)
    }
}

// ============================================================================
// Refresh-token exchange
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    id_token: String,
    refresh_token: Option<String>,
}

struct RefreshState {
    refresh_token: String,
    id_token: Option<String>,
}

/// Exchanges a long-lived refresh token for short-lived id tokens at a
/// secure-token endpoint (`grant_type=refresh_token`, form encoded).
///
/// The last id token is reused until a forced refresh. A rotated refresh
/// token in the response replaces the old one.
pub struct RefreshTokenIdentity {
    client: Client,
    token_url: String,
    state: Mutex<RefreshState>,
}

impl RefreshTokenIdentity {
    pub fn new(client: Client, token_url: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            state: Mutex::new(RefreshState {
                refresh_token: refresh_token.into(),
                id_token: None,
            }),
        }
    }
}

#[async_trait]
impl IdentityProvider for RefreshTokenIdentity {
    async fn acquire_token(&self, force_refresh: bool) -> Result<String, IdentityError> {
        let mut state = self.state.lock().await;

        if !force_refresh {
            if let Some(ref token) = state.id_token {
                return Ok(token.clone());
            }
        }

        debug!(url = %self.token_url, "Exchanging refresh token");
        let response = self
            .client
            .post(&self.token_url)
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", state.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| IdentityError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return match status.as_u16() {
                400 | 401 | 403 => {
                    warn!(status = status.as_u16(), "Refresh token no longer accepted");
                    state.id_token = None;
                    Err(IdentityError::NoSession)
                }
                500..=599 => Err(IdentityError::Unreachable(format!("HTTP {}", status))),
                _ => Err(IdentityError::Rejected(format!("HTTP {}: {}", status, body))),
            };
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Rejected(format!("unreadable token response: {}", e)))?;

        if let Some(rotated) = parsed.refresh_token {
            state.refresh_token = rotated;
        }
        state.id_token = Some(parsed.id_token.clone());
        Ok(parsed.id_token)
    }
}
