//! Credential providers.
//!
//! The engine only sees an opaque `(header name, token)` pair via
//! [`Authentication`]. `fetch` may return a cached credential;
//! `fetch_on_expiry` is called after the service rejected a handshake with
//! 403 and must return a fresh one.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Issued tokens are valid for ten minutes.
const ISSUED_TOKEN_LIFETIME: Duration = Duration::from_secs(600);
/// Refresh this long before the token actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub header_name: String,
    pub token: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidArgument(String),

    #[error("Authentication failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Authentication: Send + Sync {
    async fn fetch(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError>;

    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError>;
}

// =============================================================================
// Subscription key
// =============================================================================

/// Sends the subscription key itself on every handshake.
pub struct SubscriptionKeyAuth {
    info: AuthInfo,
}

impl SubscriptionKeyAuth {
    pub fn new(subscription_key: impl Into<String>) -> Result<Self, AuthError> {
        let key = subscription_key.into();
        if key.trim().is_empty() {
            return Err(AuthError::InvalidArgument(
                "subscription key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            info: AuthInfo {
                header_name: SUBSCRIPTION_KEY_HEADER.to_string(),
                token: key,
            },
        })
    }
}

#[async_trait]
impl Authentication for SubscriptionKeyAuth {
    async fn fetch(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        Ok(self.info.clone())
    }

    async fn fetch_on_expiry(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        Ok(self.info.clone())
    }
}

// =============================================================================
// Issued bearer token
// =============================================================================

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now() + TOKEN_EXPIRY_MARGIN
    }
}

/// Exchanges the subscription key for a short-lived bearer token at the
/// regional `issueToken` endpoint and caches it until shortly before expiry.
pub struct IssueTokenAuth {
    subscription_key: String,
    token_url: String,
    client: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
}

impl IssueTokenAuth {
    pub fn new(subscription_key: impl Into<String>, region: &str) -> Result<Self, AuthError> {
        let token_url = format!("https://{region}.api.cognitive.microsoft.com/sts/v1.0/issueToken");
        Self::with_token_url(subscription_key, token_url)
    }

    pub fn with_token_url(
        subscription_key: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let subscription_key = subscription_key.into();
        if subscription_key.trim().is_empty() {
            return Err(AuthError::InvalidArgument(
                "subscription key must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Failed(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            subscription_key,
            token_url: token_url.into(),
            client,
            cached: RwLock::new(None),
        })
    }

    async fn issue_token(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        debug!(auth_fetch_event_id, url = %self.token_url, "Requesting access token");
        let response = self
            .client
            .post(&self.token_url)
            .header(SUBSCRIPTION_KEY_HEADER, &self.subscription_key)
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| AuthError::Failed(format!("Failed to request token: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AuthError::Failed(format!(
                "Token request failed ({status}): {body}"
            )));
        }

        let token = response
            .text()
            .await
            .map_err(|e| AuthError::Failed(format!("Failed to read token: {e}")))?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(AuthError::Failed("Token endpoint returned an empty token".to_string()));
        }

        *self.cached.write().await = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + ISSUED_TOKEN_LIFETIME,
        });
        info!(auth_fetch_event_id, "Access token issued");

        Ok(bearer(token))
    }
}

fn bearer(token: String) -> AuthInfo {
    AuthInfo {
        header_name: AUTHORIZATION_HEADER.to_string(),
        token: format!("Bearer {token}"),
    }
}

#[async_trait]
impl Authentication for IssueTokenAuth {
    async fn fetch(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        {
            let cached = self.cached.read().await;
            if let Some(cached) = cached.as_ref() {
                if !cached.is_expired() {
                    return Ok(bearer(cached.token.clone()));
                }
            }
        }
        self.issue_token(auth_fetch_event_id).await
    }

    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, AuthError> {
        self.issue_token(auth_fetch_event_id).await
    }
}
