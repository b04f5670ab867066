//! HTTP client for the identity service.
//!
//! Speaks JSON over `POST {base}/auth/{login,validate,refresh}` and maps HTTP
//! failures onto `IdentityError` so the lifecycle can tell a rejected
//! credential from a flaky network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::identity::{IdentityService, Validation};
use super::IdentityError;
use crate::auth::{RefreshToken, TokenPair, UserProfile};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

impl From<TokenResponse> for TokenPair {
    fn from(t: TokenResponse) -> Self {
        TokenPair::new(t.access_token, t.refresh_token)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    is_valid: bool,
    #[serde(default)]
    tokens: Option<TokenResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    user: UserProfile,
    access_token: String,
    refresh_token: String,
}

/// Identity service client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpIdentityClient {
    client: Client,
    base_url: String,
}

impl HttpIdentityClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, IdentityError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Authenticate with email and password, returning the profile and a
    /// fresh credential pair.
    pub async fn login(&self, email: &str, password: &str) -> Result<(UserProfile, TokenPair), IdentityError> {
        let response: LoginResponse = self.post("auth/login", &LoginRequest { email, password }).await?;
        debug!(user_id = %response.user.id, "Login succeeded");
        Ok((
            response.user,
            TokenPair::new(response.access_token, response.refresh_token),
        ))
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, IdentityError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(IdentityError::from_status(status, &body))
        }
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, IdentityError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .post(&url)
                .header(header::ACCEPT, "application/json")
                .json(body)
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let text = response.text().await?;
                    return serde_json::from_str(&text).map_err(|e| {
                        IdentityError::InvalidResponse(format!("Failed to parse response from {}: {}", path, e))
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(IdentityError::RateLimited);
                    }
                    warn!(path, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }
}

#[async_trait]
impl IdentityService for HttpIdentityClient {
    async fn validate(&self, refresh_token: &RefreshToken) -> Result<Validation, IdentityError> {
        let request = RefreshRequest {
            refresh_token: refresh_token.expose(),
        };
        match self.post::<ValidateResponse, _>("auth/validate", &request).await {
            Ok(response) => Ok(Validation {
                is_valid: response.is_valid,
                tokens: response.tokens.map(TokenPair::from),
            }),
            // A rejected token is an answer, not a failure
            Err(IdentityError::InvalidCredential(reason)) => {
                debug!(%reason, "Refresh token rejected during validation");
                Ok(Validation::invalid())
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair, IdentityError> {
        let request = RefreshRequest {
            refresh_token: refresh_token.expose(),
        };
        let response: TokenResponse = self.post("auth/refresh", &request).await?;
        Ok(response.into())
    }
}
