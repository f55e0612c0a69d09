use crate::config::OAuthConfig;
use crate::error::CrawlError;
use async_trait::async_trait;
use log::{error, info};
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Credential lifecycle, observable for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    Expiring,
    Refreshing,
    Invalid,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
}

/// The refresh-token exchange against the provider's token endpoint.
/// Injected so tests can count exchanges and fail them on demand.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange_refresh_token(&self) -> Result<TokenResponse, CrawlError>;
}

/// Real exchanger: form-encoded refresh-token grant, JSON response.
pub struct OAuthHttpExchanger {
    http: reqwest::Client,
    config: OAuthConfig,
}

impl OAuthHttpExchanger {
    pub fn new(http: reqwest::Client, config: OAuthConfig) -> Self {
        OAuthHttpExchanger { http, config }
    }
}

#[async_trait]
impl TokenExchanger for OAuthHttpExchanger {
    async fn exchange_refresh_token(&self) -> Result<TokenResponse, CrawlError> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", self.config.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| CrawlError::Auth(format!("token endpoint unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrawlError::Auth(format!(
                "token refresh rejected (HTTP {status}): {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| CrawlError::Auth(format!("malformed token response: {e}")))
    }
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Owns the process-wide OAuth2 access token. The refresh path is the single
/// point of mutual exclusion in the pipeline: the async mutex serializes
/// refreshes, so callers arriving mid-refresh wait for that one exchange
/// instead of issuing their own.
pub struct TokenManager {
    exchanger: Box<dyn TokenExchanger>,
    refresh_margin: Duration,
    cached: tokio::sync::Mutex<Option<CachedToken>>,
    state: Mutex<TokenState>,
}

impl TokenManager {
    pub fn new(exchanger: Box<dyn TokenExchanger>, refresh_margin: Duration) -> Self {
        TokenManager {
            exchanger,
            refresh_margin,
            cached: tokio::sync::Mutex::new(None),
            state: Mutex::new(TokenState::Invalid),
        }
    }

    pub fn state(&self) -> TokenState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: TokenState) {
        *self.state.lock().unwrap() = state;
    }

    /// Returns a currently-valid access token, refreshing first if the
    /// cached one is inside the safety margin.
    pub async fn acquire_token(&self) -> Result<String, CrawlError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + self.refresh_margin {
                return Ok(token.access_token.clone());
            }
            self.set_state(TokenState::Expiring);
        }

        self.refresh_locked(&mut cached).await?;
        Ok(cached
            .as_ref()
            .map(|t| t.access_token.clone())
            .unwrap_or_default())
    }

    /// Drop the cached token and refresh unconditionally. Used by the
    /// scheduler's one-shot retry after an auth failure.
    pub async fn force_refresh(&self) -> Result<(), CrawlError> {
        let mut cached = self.cached.lock().await;
        *cached = None;
        self.refresh_locked(&mut cached).await
    }

    async fn refresh_locked(
        &self,
        cached: &mut Option<CachedToken>,
    ) -> Result<(), CrawlError> {
        self.set_state(TokenState::Refreshing);
        match self.exchanger.exchange_refresh_token().await {
            Ok(response) => {
                info!(
                    "OAuth token refreshed, valid for {}s",
                    response.expires_in
                );
                *cached = Some(CachedToken {
                    access_token: response.access_token,
                    expires_at: Instant::now() + Duration::from_secs(response.expires_in),
                });
                self.set_state(TokenState::Valid);
                Ok(())
            }
            Err(e) => {
                error!("OAuth token refresh failed: {e}");
                *cached = None;
                self.set_state(TokenState::Invalid);
                Err(e)
            }
        }
    }
}
