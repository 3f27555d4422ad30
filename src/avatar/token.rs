//! Avatar session token exchange
//!
//! Talks to the avatar rendering service's REST surface: issue a bridge token
//! for an avatar identifier, and revoke it again on teardown so the token is
//! invalidated server-side.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A bridge token issued by the avatar rendering service
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeToken {
    /// Opaque token presented when opening the bridge connection
    pub token: String,
}

#[derive(Debug, Serialize)]
struct IssueRequest<'a> {
    avatar_id: &'a str,
}

#[derive(Debug, Serialize)]
struct RevokeRequest<'a> {
    token: &'a str,
}

/// REST client for the token-issuing collaborator
#[derive(Debug, Clone)]
pub struct TokenClient {
    client: reqwest::Client,
    base_url: String,
    default_credential: Option<String>,
}

impl TokenClient {
    /// Create a token client for the avatar service at `base_url`
    #[must_use]
    pub fn new(base_url: &str, default_credential: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            default_credential,
        }
    }

    /// Issue a bridge token for an avatar identifier
    ///
    /// Uses the per-session credential when given, otherwise the server
    /// default.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when no credential is available at all, and
    /// `Error::Bridge` for request failures or a malformed token response
    pub async fn issue(&self, avatar_id: &str, credential: Option<&str>) -> Result<BridgeToken> {
        let credential = credential
            .or(self.default_credential.as_deref())
            .ok_or_else(|| Error::Config("no avatar credential available".to_string()))?;

        let response = self
            .client
            .post(format!("{}/v1/tokens", self.base_url))
            .bearer_auth(credential)
            .json(&IssueRequest { avatar_id })
            .send()
            .await
            .map_err(|e| Error::Bridge(format!("token issue request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Bridge(format!("token issue failed {status}: {body}")));
        }

        let token: BridgeToken = response
            .json()
            .await
            .map_err(|e| Error::Bridge(format!("malformed token response: {e}")))?;

        tracing::debug!(avatar_id, "bridge token issued");
        Ok(token)
    }

    /// Revoke a previously issued token
    ///
    /// # Errors
    ///
    /// Returns `Error::Bridge` on request failure; callers treat this as a
    /// logged, non-fatal condition because local teardown proceeds regardless
    pub async fn revoke(&self, token: &BridgeToken) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/tokens/revoke", self.base_url))
            .json(&RevokeRequest {
                token: &token.token,
            })
            .send()
            .await
            .map_err(|e| Error::Bridge(format!("token revoke request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Bridge(format!("token revoke failed: {status}")));
        }

        tracing::debug!("bridge token revoked");
        Ok(())
    }
}
