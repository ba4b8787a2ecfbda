//! OAuth2 token provider for the UAA identity service.
//!
//! The metric store sits behind UAA. The router authenticates with the
//! resource-owner password grant, presenting both the client and the user
//! credentials, and caches the resulting token until shortly before it
//! expires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// How long before expiry a cached token is considered stale.
const EXPIRY_MARGIN_SECS: i64 = 30;

/// Timeout for a token request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Errors obtaining a token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The identity service could not be reached.
    #[error("token request failed: {0}")]
    Transport(String),

    /// The identity service rejected the request.
    #[error("token request was rejected with status {0}")]
    Rejected(StatusCode),

    /// The token response could not be decoded.
    #[error("invalid token response: {0}")]
    Decode(String),
}

/// Capability to produce an `Authorization` header value.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a value suitable for the `Authorization` header, e.g.
    /// `bearer <token>`.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] when no valid token can be obtained.
    async fn token(&self) -> Result<String, AuthError>;
}

/// Password-grant UAA client with expiry-aware caching.
pub struct UaaClient {
    endpoint: Url,
    client_id: String,
    client_secret: SecretString,
    user: String,
    password: SecretString,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    header_value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,

    #[serde(default = "default_token_type")]
    token_type: String,

    #[serde(default)]
    expires_in: i64,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl UaaClient {
    /// Builds a client against the identity service at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] when the endpoint URL or the HTTP client
    /// cannot be constructed.
    pub fn new(
        addr: &Url,
        client_id: impl Into<String>,
        client_secret: SecretString,
        user: impl Into<String>,
        password: SecretString,
        skip_tls_verify: bool,
    ) -> Result<Self, AuthError> {
        let endpoint = addr
            .join("/oauth/token")
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(skip_tls_verify)
            .build()
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        Ok(Self {
            endpoint,
            client_id: client_id.into(),
            client_secret,
            user: user.into(),
            password,
            http,
            cached: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<CachedToken, AuthError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .form(&[
                ("grant_type", "password"),
                ("client_id", &self.client_id),
                ("client_secret", self.client_secret.expose_secret()),
                ("username", &self.user),
                ("password", self.password.expose_secret()),
            ])
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::Rejected(response.status()));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Decode(err.to_string()))?;

        debug!(expires_in = token.expires_in, "obtained a fresh token");
        Ok(CachedToken {
            header_value: format!("{} {}", token.token_type, token.access_token),
            expires_at: Utc::now()
                + chrono::Duration::seconds((token.expires_in - EXPIRY_MARGIN_SECS).max(0)),
        })
    }
}

#[async_trait]
impl TokenProvider for UaaClient {
    async fn token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.header_value.clone());
            }
        }

        let fresh = self.fetch().await?;
        let header_value = fresh.header_value.clone();
        *cached = Some(fresh);
        Ok(header_value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::routing::post;

    use super::*;

    async fn token_endpoint(State(hits): State<Arc<AtomicUsize>>) -> axum::Json<serde_json::Value> {
        hits.fetch_add(1, Ordering::SeqCst);
        axum::Json(serde_json::json!({
            "access_token": "token-abc",
            "token_type": "bearer",
            "expires_in": 600,
        }))
    }

    async fn spawn_uaa() -> (Url, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/oauth/token", post(token_endpoint))
            .with_state(hits.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (Url::parse(&format!("http://{addr}")).unwrap(), hits)
    }

    fn client_against(addr: &Url) -> UaaClient {
        UaaClient::new(
            addr,
            "canary-router",
            SecretString::from("shhh"),
            "deployer",
            SecretString::from("hunter2"),
            false,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_produces_an_authorization_header_value() {
        let (addr, _hits) = spawn_uaa().await;
        let client = client_against(&addr);

        assert_eq!(client.token().await.unwrap(), "bearer token-abc");
    }

    #[tokio::test]
    async fn test_reuses_the_cached_token_until_expiry() {
        let (addr, hits) = spawn_uaa().await;
        let client = client_against(&addr);

        client.token().await.unwrap();
        client.token().await.unwrap();
        client.token().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejection_surfaces_as_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/oauth/token",
            post(|| async { (axum::http::StatusCode::UNAUTHORIZED, "nope") }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = client_against(&Url::parse(&format!("http://{addr}")).unwrap());
        assert!(matches!(
            client.token().await,
            Err(AuthError::Rejected(StatusCode::UNAUTHORIZED))
        ));
    }
}
