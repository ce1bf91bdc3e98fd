use crate::{
    auth::Authentication,
    config::{CacheStore, RetryPolicy, SessionCache},
    error::{NextcodeError, NextcodeResult},
    models::{RootInfo, ServiceStatus},
};
use log::{debug, error, info, warn};
use reqwest::{
    header::{HeaderValue, ACCEPT, CONTENT_TYPE},
    Client, Method, Request, RequestBuilder, Response, StatusCode,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use url::Url;

pub(crate) const JSON: &str = "application/json";

struct SessionInner {
    client: Client,
    auth: Arc<dyn Authentication>,
    retry: RetryPolicy,
    cache: Option<CacheStore>,
    cache_name: String,
    base_url: Url,
    root_info: RwLock<RootInfo>,
}

/// Low-level connection to one REST service.
///
/// Knows the service's base URL and the endpoints it exports, applies the
/// bearer token to every request, refreshes the token once on a 401 and
/// retries idempotent requests that fail with a transient server error.
#[derive(Clone)]
pub struct ServiceSession {
    inner: Arc<SessionInner>,
}

impl ServiceSession {
    /// Connect to the service at `base_url`, using cached root info and token when present
    pub(crate) async fn connect(
        client: Client,
        auth: Arc<dyn Authentication>,
        retry: RetryPolicy,
        cache: Option<CacheStore>,
        api_name: &str,
        api_key: &str,
        base_url: Url,
    ) -> NextcodeResult<Self> {
        let cache_name = CacheStore::cache_name(api_name, base_url.as_str(), api_key);
        let cached = cache.as_ref().and_then(|c| c.load(&cache_name));
        let session = Self {
            inner: Arc::new(SessionInner {
                client,
                auth,
                retry,
                cache,
                cache_name,
                base_url,
                root_info: RwLock::new(RootInfo::default()),
            }),
        };

        let restored = match cached {
            Some(SessionCache { token, root_info }) => match serde_json::from_value(root_info) {
                Ok(info) => {
                    if let Some(token) = token {
                        session.inner.auth.seed_token(token).await;
                    }
                    *session.inner.root_info.write().await = info;
                    true
                }
                Err(e) => {
                    warn!("Ignoring cached root info: {}", e);
                    false
                }
            },
            None => false,
        };

        if !restored {
            session.initialize().await?;
        }
        Ok(session)
    }

    async fn initialize(&self) -> NextcodeResult<()> {
        self.inner.auth.refresh().await?;
        self.fetch_root_info().await?;
        self.save().await;
        Ok(())
    }

    async fn save(&self) {
        if let Some(cache) = &self.inner.cache {
            let contents = SessionCache {
                token: self.inner.auth.access_token().await,
                root_info: serde_json::to_value(&*self.inner.root_info.read().await)
                    .unwrap_or_default(),
            };
            cache.save(&self.inner.cache_name, &contents);
        }
    }

    /// Base URL of the service
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Snapshot of the root document
    pub async fn root_info(&self) -> RootInfo {
        self.inner.root_info.read().await.clone()
    }

    /// Re-read the root document from the service
    pub async fn fetch_root_info(&self) -> NextcodeResult<RootInfo> {
        debug!("fetch_root_info(): url_base: {}", self.inner.base_url);
        let req = self.request(Method::GET, self.inner.base_url.as_str())?;
        let response = match self.send(req).await {
            Ok(response) => response,
            Err(NextcodeError::Http(e)) if e.is_connect() || e.is_timeout() => {
                return Err(NextcodeError::server(format!(
                    "Could not reach server {}",
                    self.inner.base_url
                )))
            }
            Err(e) => return Err(e),
        };

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with(JSON))
            .unwrap_or(false);
        if !is_json {
            let body = response.text().await.unwrap_or_default();
            return Err(NextcodeError::Server {
                status: None,
                message: format!("Unexpected response: {}", body),
                url: Some(self.inner.base_url.to_string()),
                response: None,
            });
        }

        let info: RootInfo = response.json().await?;
        *self.inner.root_info.write().await = info.clone();
        Ok(info)
    }

    /// Absolute URL of a named endpoint exported by the service
    pub async fn url_from_endpoint(&self, endpoint: &str) -> NextcodeResult<String> {
        let info = self.inner.root_info.read().await;
        info.endpoints.get(endpoint).cloned().ok_or_else(|| {
            let available: Vec<&str> = info.endpoints.keys().map(String::as_str).collect();
            NextcodeError::server(format!(
                "Endpoint '{}' is not exported by '{}'.\nAvailable endpoints are {}",
                endpoint,
                self.inner.base_url,
                available.join(", ")
            ))
        })
    }

    /// Build a request to an absolute URL, or to a path relative to the base URL
    pub fn request(&self, method: Method, url: &str) -> NextcodeResult<RequestBuilder> {
        let url = self.inner.base_url.join(url)?;
        Ok(self.inner.client.request(method, url))
    }

    /// Send a request, returning the raw response once it succeeded
    pub async fn send(&self, request: RequestBuilder) -> NextcodeResult<Response> {
        let request = request.build()?;
        let mut refreshed = false;
        let mut attempt = 0u32;

        loop {
            let mut current = request.try_clone().ok_or_else(|| {
                NextcodeError::invalid_param("Request body cannot be resent")
            })?;
            if !current.headers().contains_key(ACCEPT) {
                current.headers_mut().insert(ACCEPT, HeaderValue::from_static(JSON));
            }
            self.inner.auth.apply_auth(current.headers_mut()).await?;
            log_request(&current);

            let started = Instant::now();
            let result = self.inner.client.execute(current).await;
            let retryable = is_idempotent(request.method()) && attempt < self.inner.retry.max_retries;

            let response = match result {
                Ok(response) => response,
                Err(e) if retryable && (e.is_connect() || e.is_timeout()) => {
                    attempt += 1;
                    warn!("{} {} failed ({}), retry {}", request.method(), request.url(), e, attempt);
                    tokio::time::sleep(self.inner.retry.backoff(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            info!(
                "{} {} returned {} in {:.3} sec",
                request.method(),
                request.url(),
                status.as_u16(),
                started.elapsed().as_secs_f64()
            );

            if status == StatusCode::UNAUTHORIZED {
                if !refreshed {
                    debug!("Status code {}, retrying once...", status);
                    refreshed = true;
                    self.inner.auth.refresh().await?;
                    self.save().await;
                    continue;
                }
                error!("Received unauthorized in retry");
            }

            if retryable && self.inner.retry.should_retry_status(status.as_u16()) {
                attempt += 1;
                warn!("{} {} returned {}, retry {}", request.method(), request.url(), status, attempt);
                tokio::time::sleep(self.inner.retry.backoff(attempt)).await;
                continue;
            }

            return check_response(response).await;
        }
    }

    /// Send a request and deserialize the JSON response
    pub async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> NextcodeResult<T> {
        let response = self.send(request).await?;
        Ok(response.json::<T>().await?)
    }

    /// Send a request and return the response body as text
    pub async fn execute_text(&self, request: RequestBuilder) -> NextcodeResult<String> {
        let response = self.send(request).await?;
        Ok(response.text().await?)
    }

    /// GET an absolute URL and deserialize the JSON response
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> NextcodeResult<T> {
        let req = self.request(Method::GET, url)?;
        self.execute(req).await
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
    )
}

fn log_request(request: &Request) {
    debug!("Calling {} {}", request.method(), request.url());
    if log::log_enabled!(log::Level::Debug) {
        let headers: Vec<String> = request
            .headers()
            .iter()
            .map(|(name, value)| {
                if name == reqwest::header::AUTHORIZATION {
                    format!("{}: Bearer ***", name)
                } else {
                    format!("{}: {}", name, value.to_str().unwrap_or("<binary>"))
                }
            })
            .collect();
        debug!("Headers: {}", headers.join(", "));
        if let Some(body) = request.body().and_then(|b| b.as_bytes()) {
            debug!("Payload:\n{}", String::from_utf8_lossy(body));
        }
    }
}

/// Turn any non-success response into a server error carrying the service's description
async fn check_response(response: Response) -> NextcodeResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let text = response.text().await.unwrap_or_default();
    let json: Option<serde_json::Value> = serde_json::from_str(&text).ok();

    let description = json.as_ref().and_then(|body| {
        let error = body.get("error")?;
        let mut desc = error.get("description")?.as_str()?.to_string();
        if let Some(errors) = error.get("errors") {
            desc.push_str(&format!(" ({})", errors));
        }
        Some(desc)
    });

    let message = if status.is_server_error() {
        let desc = format!("Server error in call to {} - Response body: {}", url, text);
        error!("{}", desc);
        desc
    } else {
        info!("Server error in call to {}", url);
        match description {
            Some(desc) => format!("{} (code {})", desc, status.as_u16()),
            None if !text.is_empty() => format!("{} (code {})", text, status.as_u16()),
            None => format!("Status code {} received", status.as_u16()),
        }
    };

    Err(NextcodeError::api_error(status.as_u16(), message, url, json))
}

/// Operations every service exposes through its root document
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    fn session(&self) -> &ServiceSession;

    /// Is the service healthy?
    async fn healthy(&self) -> bool {
        let session = self.session();
        let Ok(url) = session.url_from_endpoint("health").await else {
            return false;
        };
        match session.request(Method::GET, &url) {
            Ok(req) => session.send(req).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Service information from the root endpoint
    async fn status(&self, force: bool) -> NextcodeResult<ServiceStatus> {
        let info = if force {
            self.session().fetch_root_info().await?
        } else {
            self.session().root_info().await
        };
        Ok(ServiceStatus {
            build_info: info.build_info,
            app_info: info.app_info,
            service_name: info.service_name,
            root: info.endpoints.get("root").cloned(),
        })
    }

    /// User JWT as decoded by the service
    async fn current_user(&self) -> Option<serde_json::Value> {
        self.session().root_info().await.current_user
    }

    /// Name to URL map of the endpoints exported by the service
    async fn endpoints(&self) -> std::collections::BTreeMap<String, String> {
        self.session().root_info().await.endpoints
    }

    /// Raw OpenAPI document for the service
    async fn openapi_spec(&self) -> NextcodeResult<serde_json::Value> {
        let url = self.session().url_from_endpoint("documentation").await?;
        self.session().get_json(&url).await
    }
}
