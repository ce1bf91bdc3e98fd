use crate::error::{NextcodeError, NextcodeResult};
use base64::{engine::general_purpose, Engine};
use log::{error, info};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

const TOKEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Claims carried in an API key or access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Realm URL of the identity provider
    pub iss: Option<String>,
    /// OAuth client id the token was issued to
    pub azp: Option<String>,
    pub exp: Option<i64>,
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Decode the payload of a JWT without verifying its signature
pub fn decode_token(token: &str) -> NextcodeResult<Claims> {
    let payload = token
        .split('.')
        .nth(1)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| NextcodeError::InvalidToken(format!("Token could not be decoded: {}", token)))?;
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| NextcodeError::InvalidToken(format!("Token could not be decoded ({}): {}", e, token)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| NextcodeError::InvalidToken(format!("Token could not be decoded ({}): {}", e, token)))
}

fn issuer(claims: &Claims) -> NextcodeResult<&str> {
    claims
        .iss
        .as_deref()
        .ok_or_else(|| NextcodeError::InvalidToken("Token has no issuer".to_string()))
}

/// Server root (`scheme://host[:port]`) of the identity provider that issued the key
pub fn root_url_from_api_key(api_key: &str) -> NextcodeResult<String> {
    let claims = decode_token(api_key)?;
    let iss = Url::parse(issuer(&claims)?)
        .map_err(|e| NextcodeError::InvalidToken(format!("Invalid issuer in token: {}", e)))?;
    let host = iss
        .host_str()
        .ok_or_else(|| NextcodeError::InvalidToken("Issuer has no host".to_string()))?;
    Ok(match iss.port() {
        Some(port) => format!("{}://{}:{}", iss.scheme(), host, port),
        None => format!("{}://{}", iss.scheme(), host),
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error_description: Option<String>,
}

/// Exchange an API key (refresh token) for an access token
pub async fn get_access_token(client: &Client, api_key: &str) -> NextcodeResult<String> {
    let claims = decode_token(api_key)?;
    let client_id = claims
        .azp
        .as_deref()
        .ok_or_else(|| NextcodeError::InvalidToken("Token has no client id".to_string()))?;
    let token_endpoint = format!("{}/protocol/openid-connect/token", issuer(&claims)?);
    let body = [
        ("grant_type", "refresh_token"),
        ("client_id", client_id),
        ("refresh_token", api_key),
        ("username", "dummy_user"),
    ];

    info!("Authenticating with {}", token_endpoint);
    let response = client
        .post(&token_endpoint)
        .form(&body)
        .timeout(TOKEN_TIMEOUT)
        .send()
        .await?;
    let status = response.status();
    let text = response.text().await?;

    if status == StatusCode::BAD_REQUEST && text.contains("Refresh token expired") {
        return Err(NextcodeError::InvalidToken("Refresh token has expired".to_string()));
    }
    if status.is_client_error() || status.is_server_error() {
        if let Ok(TokenErrorResponse { error_description: Some(desc) }) = serde_json::from_str(&text) {
            return Err(NextcodeError::InvalidToken(desc));
        }
        error!("Token request for client {} failed with {}", client_id, status);
        return Err(NextcodeError::InvalidToken(format!(
            "Error authenticating with {}: {}",
            token_endpoint, text
        )));
    }

    let token: TokenResponse = serde_json::from_str(&text).map_err(|_| {
        NextcodeError::InvalidToken(format!("Error authenticating with {}: {}", token_endpoint, text))
    })?;
    Ok(token.access_token)
}

/// Authentication trait for Nextcode services
#[async_trait::async_trait]
pub trait Authentication: Send + Sync {
    /// Apply authentication to the request headers
    async fn apply_auth(&self, headers: &mut reqwest::header::HeaderMap) -> NextcodeResult<()>;

    /// Obtain fresh credentials after the server rejected the current ones
    async fn refresh(&self) -> NextcodeResult<()> {
        Ok(())
    }

    /// The access token currently in use, if any
    async fn access_token(&self) -> Option<String> {
        None
    }

    /// Install a previously cached access token
    async fn seed_token(&self, _token: String) {}
}

fn bearer_header(token: &str) -> NextcodeResult<reqwest::header::HeaderValue> {
    format!("Bearer {}", token)
        .parse()
        .map_err(|e| NextcodeError::InvalidToken(format!("Invalid auth header: {}", e)))
}

/// API key authentication: the key is exchanged for an access token on first use
pub struct ApiKeyAuth {
    client: Client,
    api_key: String,
    token: RwLock<Option<String>>,
}

impl ApiKeyAuth {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            token: RwLock::new(None),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    async fn current_token(&self) -> NextcodeResult<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }
        let token = get_access_token(&self.client, &self.api_key).await?;
        *slot = Some(token.clone());
        Ok(token)
    }
}

#[async_trait::async_trait]
impl Authentication for ApiKeyAuth {
    async fn apply_auth(&self, headers: &mut reqwest::header::HeaderMap) -> NextcodeResult<()> {
        let token = self.current_token().await?;
        headers.insert(reqwest::header::AUTHORIZATION, bearer_header(&token)?);
        Ok(())
    }

    async fn refresh(&self) -> NextcodeResult<()> {
        let token = get_access_token(&self.client, &self.api_key).await?;
        *self.token.write().await = Some(token);
        info!("Access token has been updated");
        Ok(())
    }

    async fn access_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    async fn seed_token(&self, token: String) {
        *self.token.write().await = Some(token);
    }
}

/// Bearer token authentication with a fixed access token
#[derive(Debug, Clone)]
pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl Authentication for BearerAuth {
    async fn apply_auth(&self, headers: &mut reqwest::header::HeaderMap) -> NextcodeResult<()> {
        headers.insert(reqwest::header::AUTHORIZATION, bearer_header(&self.token)?);
        Ok(())
    }

    async fn access_token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}

/// No authentication
#[derive(Debug, Clone)]
pub struct NoAuth;

#[async_trait::async_trait]
impl Authentication for NoAuth {
    async fn apply_auth(&self, _headers: &mut reqwest::header::HeaderMap) -> NextcodeResult<()> {
        Ok(())
    }
}
