use crate::{
    apis::{PipelinesApi, QueryApi, WorkflowApi},
    auth::{decode_token, ApiKeyAuth, Authentication, Claims},
    config::{resolve_project, CacheStore, Config, Profile, RetryPolicy, ENV_SERVICE_PATH},
    error::{NextcodeError, NextcodeResult},
    session::ServiceSession,
};
use reqwest::Client;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// Name used for every service's session cache entry
const CACHE_API_NAME: &str = "queryapi";

/// Services reachable through a [`NextcodeClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Pipelines,
    Query,
    Workflow,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [Self::Pipelines, Self::Query, Self::Workflow];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pipelines => "pipelines",
            Self::Query => "query",
            Self::Workflow => "workflow",
        }
    }

    /// Path of the service relative to the server root
    pub fn service_path(self, root_url: &str) -> String {
        match self {
            Self::Pipelines => "pipelines-service".to_string(),
            Self::Query | Self::Workflow => {
                // services run standalone on a developer machine are served at the root
                if root_url.contains("localhost") {
                    return "/".to_string();
                }
                std::env::var(ENV_SERVICE_PATH).unwrap_or_else(|_| match self {
                    Self::Query => "/api/query".to_string(),
                    _ => "/workflow".to_string(),
                })
            }
        }
    }
}

impl FromStr for ServiceKind {
    type Err = NextcodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| NextcodeError::ServiceNotFound(s.to_string()))
    }
}

/// Builder for [`NextcodeClient`]
#[derive(Default)]
pub struct NextcodeClientBuilder {
    api_key: Option<String>,
    profile: Option<String>,
    root_url: Option<String>,
    project: Option<String>,
    config: Option<Config>,
    http: Option<Client>,
    retry: Option<RetryPolicy>,
    cache: Option<Option<CacheStore>>,
    auth: Option<Arc<dyn Authentication>>,
}

impl NextcodeClientBuilder {
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Use a named profile from the configuration
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Override the server root, e.g. `https://server.example.com`
    pub fn root_url(mut self, root_url: impl Into<String>) -> Self {
        self.root_url = Some(root_url.into());
        self
    }

    /// Default project for query and workflow operations
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Use this configuration instead of `~/.nextcode`
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom reqwest client
    pub fn http_client(mut self, client: Client) -> Self {
        self.http = Some(client);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Authenticate requests with `auth` instead of exchanging the API key
    pub fn auth(mut self, auth: impl Authentication + 'static) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    /// Session cache location, or `None` to disable caching
    pub fn cache(mut self, cache: Option<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> NextcodeResult<NextcodeClient> {
        let config = self.config.unwrap_or_else(Config::load);
        let (profile_name, mut profile) = config.resolve(
            self.profile.as_deref(),
            self.api_key.as_deref(),
            self.root_url.as_deref(),
        )?;
        profile.project = resolve_project(self.project.as_deref(), &profile);
        Url::parse(&profile.root_url)?;

        let http = match self.http {
            Some(client) => client,
            None => Client::builder()
                .user_agent(concat!("nextcode-sdk/", env!("CARGO_PKG_VERSION"), " Rust"))
                .build()?,
        };
        let auth: Arc<dyn Authentication> = match self.auth {
            Some(auth) => auth,
            None => Arc::new(ApiKeyAuth::new(http.clone(), profile.api_key.clone())),
        };

        Ok(NextcodeClient {
            http,
            profile_name,
            profile,
            auth,
            retry: self.retry.unwrap_or_else(RetryPolicy::from_env),
            cache: self.cache.unwrap_or_else(CacheStore::from_env),
            config,
        })
    }
}

/// Entry point for talking to Nextcode services
#[derive(Clone)]
pub struct NextcodeClient {
    http: Client,
    profile_name: Option<String>,
    profile: Profile,
    auth: Arc<dyn Authentication>,
    retry: RetryPolicy,
    cache: Option<CacheStore>,
    config: Config,
}

impl NextcodeClient {
    /// Create a client from an API key
    pub fn new(api_key: impl Into<String>) -> NextcodeResult<Self> {
        Self::builder().api_key(api_key).build()
    }

    /// Create a client from a named profile
    pub fn from_profile(profile: impl Into<String>) -> NextcodeResult<Self> {
        Self::builder().profile(profile).build()
    }

    pub fn builder() -> NextcodeClientBuilder {
        NextcodeClientBuilder::default()
    }

    pub fn profile_name(&self) -> Option<&str> {
        self.profile_name.as_deref()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn root_url(&self) -> &str {
        &self.profile.root_url
    }

    /// Current access token, exchanging the API key if needed
    pub async fn access_token(&self) -> NextcodeResult<String> {
        if let Some(token) = self.auth.access_token().await {
            return Ok(token);
        }
        self.auth.refresh().await?;
        self.auth
            .access_token()
            .await
            .ok_or_else(|| NextcodeError::InvalidToken("No access token issued".to_string()))
    }

    /// Claims of the current access token
    pub async fn decoded_access_token(&self) -> NextcodeResult<Claims> {
        decode_token(&self.access_token().await?)
    }

    /// Services that can be opened with [`NextcodeClient::query`] and friends
    pub fn available_services() -> Vec<&'static str> {
        ServiceKind::ALL.iter().map(|k| k.name()).collect()
    }

    /// Profiles found in the configuration
    pub fn available_profiles(&self) -> Vec<String> {
        self.config.profile_names()
    }

    pub(crate) fn project(&self) -> Option<&str> {
        self.profile.project.as_deref()
    }

    /// Open a session against a service
    pub async fn session(&self, kind: ServiceKind) -> NextcodeResult<ServiceSession> {
        let root = Url::parse(&self.profile.root_url)?;
        let base_url = root.join(&kind.service_path(&self.profile.root_url))?;
        ServiceSession::connect(
            self.http.clone(),
            self.auth.clone(),
            self.retry.clone(),
            self.cache.clone(),
            CACHE_API_NAME,
            &self.profile.api_key,
            base_url,
        )
        .await
    }

    /// Query API; `project` overrides the client's default project
    pub async fn query(&self, project: Option<&str>) -> NextcodeResult<QueryApi> {
        let session = self.session(ServiceKind::Query).await?;
        let project = project.or(self.project()).map(str::to_string);
        Ok(QueryApi::new(session, project))
    }

    /// Workflow API
    pub async fn workflow(&self) -> NextcodeResult<WorkflowApi> {
        let session = self.session(ServiceKind::Workflow).await?;
        Ok(WorkflowApi::new(session, self.project().map(str::to_string)))
    }

    /// Pipelines API
    pub async fn pipelines(&self) -> NextcodeResult<PipelinesApi> {
        let session = self.session(ServiceKind::Pipelines).await?;
        Ok(PipelinesApi::new(session))
    }
}

impl fmt::Debug for NextcodeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Client {} | {}>",
            self.profile_name.as_deref().unwrap_or("None"),
            self.profile.root_url
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_resolve() {
        assert_eq!("query".parse::<ServiceKind>().unwrap(), ServiceKind::Query);
        assert!(matches!(
            "phenotype".parse::<ServiceKind>(),
            Err(NextcodeError::ServiceNotFound(_))
        ));
        assert_eq!(NextcodeClient::available_services(), vec!["pipelines", "query", "workflow"]);
    }

    #[test]
    fn local_services_live_at_root() {
        assert_eq!(ServiceKind::Query.service_path("http://localhost:8080"), "/");
        assert_eq!(
            ServiceKind::Pipelines.service_path("http://localhost:8080"),
            "pipelines-service"
        );
    }
}
