//! Profiles, session cache and environment settings.
//!
//! Profiles live in `~/.nextcode/config.toml`:
//!
//! ```toml
//! default_profile = "prod"
//!
//! [profiles.prod]
//! api_key = "xxx.yyy.zzz"
//! root_url = "https://server.example.com"
//! project = "myproject"
//! ```

use crate::auth::root_url_from_api_key;
use crate::error::{NextcodeError, NextcodeResult};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PROFILE: &str = "NEXTCODE_PROFILE";
pub const ENV_API_KEY: &str = "GOR_API_KEY";
pub const ENV_ROOT_URL: &str = "NEXTCODE_ROOT_URL";
pub const ENV_PROJECT: &str = "GOR_API_PROJECT";
pub const ENV_SERVICE_PATH: &str = "NEXTCODE_SERVICE_PATH";
pub const ENV_DISABLE_CACHE: &str = "NEXTCODE_DISABLE_CACHE";
pub const ENV_DISABLE_RETRY: &str = "NEXTCODE_DISABLE_RETRY";

const CONFIG_FILE: &str = "config.toml";
const CACHE_FOLDER: &str = "cache";

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Connection settings for one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub api_key: String,
    pub root_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl Profile {
    /// Build a profile from an API key, deriving the root URL from the key when not given
    pub fn from_api_key(api_key: impl Into<String>, root_url: Option<&str>) -> NextcodeResult<Self> {
        let api_key = api_key.into();
        let derived = root_url_from_api_key(&api_key)
            .map_err(|_| NextcodeError::InvalidProfile("Profile does not contain a valid api_key".to_string()))?;
        Ok(Self {
            root_url: root_url.map(str::to_string).unwrap_or(derived),
            api_key,
            project: None,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredProfile {
    api_key: Option<String>,
    root_url: Option<String>,
    project: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    default_profile: Option<String>,
    #[serde(default)]
    profiles: BTreeMap<String, StoredProfile>,
}

/// Persisted profile configuration rooted at a folder (`~/.nextcode` by default)
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    default_profile: Option<String>,
    profiles: BTreeMap<String, Profile>,
}

impl Config {
    /// Default configuration folder
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nextcode")
    }

    /// Load the configuration from the default folder
    pub fn load() -> Self {
        Self::load_from(Self::default_root())
    }

    /// Load the configuration from `root`. A missing or invalid file yields an empty config.
    pub fn load_from(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let path = root.join(CONFIG_FILE);
        let file = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str::<ConfigFile>(&content).unwrap_or_else(|e| {
                info!("Config file {} is invalid: {}", path.display(), e);
                ConfigFile::default()
            }),
            Err(_) => {
                info!("Config file not found at {}", path.display());
                ConfigFile::default()
            }
        };

        let mut profiles = BTreeMap::new();
        for (name, stored) in file.profiles {
            let prepared = stored.api_key.as_deref().and_then(|key| {
                Profile::from_api_key(key, stored.root_url.as_deref()).ok()
            });
            match prepared {
                Some(mut profile) => {
                    profile.project = stored.project;
                    profiles.insert(name, profile);
                }
                None => info!("Profile '{}' is invalid and will be ignored", name),
            }
        }

        Self {
            root,
            default_profile: file.default_profile,
            profiles,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn default_profile(&self) -> Option<&str> {
        self.default_profile.as_deref()
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Names of all valid profiles
    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    /// Create (or replace) a profile and persist the configuration
    pub fn create_profile(
        &mut self,
        name: &str,
        api_key: &str,
        root_url: Option<&str>,
    ) -> NextcodeResult<&Profile> {
        let profile = Profile::from_api_key(api_key, root_url)?;
        self.profiles.insert(name.to_string(), profile);
        self.save()?;
        self.profiles
            .get(name)
            .ok_or_else(|| NextcodeError::InvalidProfile(name.to_string()))
    }

    /// Set the profile used when neither a profile nor an API key is given
    pub fn set_default_profile(&mut self, name: &str) -> NextcodeResult<()> {
        if !self.profiles.contains_key(name) {
            return Err(NextcodeError::InvalidProfile("Profile does not exist".to_string()));
        }
        self.default_profile = Some(name.to_string());
        self.save()
    }

    /// Write the configuration to disk
    pub fn save(&self) -> NextcodeResult<()> {
        let file = ConfigFile {
            default_profile: self.default_profile.clone(),
            profiles: self
                .profiles
                .iter()
                .map(|(name, p)| {
                    let stored = StoredProfile {
                        api_key: Some(p.api_key.clone()),
                        root_url: Some(p.root_url.clone()),
                        project: p.project.clone(),
                    };
                    (name.clone(), stored)
                })
                .collect(),
        };
        let path = self.root.join(CONFIG_FILE);
        debug!("Saving config with {} profiles to {}", self.profiles.len(), path.display());
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(&path, toml::to_string(&file)?)?;
        Ok(())
    }

    /// Resolve which profile a client should use.
    ///
    /// Order of precedence: explicit profile, explicit API key,
    /// `NEXTCODE_PROFILE`, configured default profile, `GOR_API_KEY`.
    pub fn resolve(
        &self,
        profile: Option<&str>,
        api_key: Option<&str>,
        root_url: Option<&str>,
    ) -> NextcodeResult<(Option<String>, Profile)> {
        let profile_name = match (profile, api_key) {
            (Some(name), _) => Some(name.to_string()),
            (None, Some(_)) => None,
            (None, None) => env_var(ENV_PROFILE).or_else(|| self.default_profile.clone()),
        };

        if let Some(name) = profile_name {
            info!(
                "Initializing client with profile '{}'. Available profiles: {:?}",
                name,
                self.profile_names()
            );
            let mut profile = self.profiles.get(&name).cloned().ok_or_else(|| {
                NextcodeError::InvalidProfile(format!("The config profile ({}) could not be found", name))
            })?;
            if let Some(url) = root_url {
                profile.root_url = url.to_string();
            }
            return Ok((Some(name), profile));
        }

        let api_key = api_key.map(str::to_string).or_else(|| env_var(ENV_API_KEY)).ok_or_else(|| {
            NextcodeError::InvalidProfile(
                "No profile specified and GOR_API_KEY not set in environment".to_string(),
            )
        })?;
        let root_url = root_url.map(str::to_string).or_else(|| env_var(ENV_ROOT_URL));
        let root_url = match root_url {
            Some(url) => url,
            None => root_url_from_api_key(&api_key)?,
        };
        Ok((
            None,
            Profile {
                api_key,
                root_url,
                project: None,
            },
        ))
    }
}

/// Project to run queries and jobs in: explicit, `GOR_API_PROJECT`, then the profile's
pub fn resolve_project(explicit: Option<&str>, profile: &Profile) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| env_var(ENV_PROJECT))
        .or_else(|| profile.project.clone())
}

/// Retry behaviour for idempotent requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: Duration,
    pub status_forcelist: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_factor: Duration::from_millis(500),
            status_forcelist: vec![500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Default policy unless `NEXTCODE_DISABLE_RETRY` is set
    pub fn from_env() -> Self {
        if env_var(ENV_DISABLE_RETRY).is_some() {
            Self::disabled()
        } else {
            Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(8);
        self.backoff_factor.saturating_mul(1u32 << exp)
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.status_forcelist.contains(&status)
    }
}

/// Token and root info persisted between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCache {
    pub token: Option<String>,
    pub root_info: serde_json::Value,
}

/// On-disk cache of session state, one file per service/key pair
#[derive(Debug, Clone)]
pub struct CacheStore {
    folder: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            folder: root.as_ref().join(CACHE_FOLDER),
        }
    }

    /// Cache under the default config folder unless `NEXTCODE_DISABLE_CACHE` is set
    pub fn from_env() -> Option<Self> {
        if env_var(ENV_DISABLE_CACHE).is_some() {
            None
        } else {
            Some(Self::new(Config::default_root()))
        }
    }

    /// Cache file name for a service session
    pub fn cache_name(api_name: &str, base_url: &str, api_key: &str) -> String {
        format!("{:x}", md5::compute(format!("{}{}{}", api_name, base_url, api_key)))
    }

    fn path(&self, name: &str) -> PathBuf {
        self.folder.join(format!("{}.cache", name))
    }

    pub fn load(&self, name: &str) -> Option<SessionCache> {
        let path = self.path(name);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(cache) => {
                info!("Loaded contents from cache {}", path.display());
                Some(cache)
            }
            Err(e) => {
                warn!("Could not load from cache {}: {}", path.display(), e);
                None
            }
        }
    }

    fn write(&self, path: &Path, contents: &SessionCache) -> NextcodeResult<()> {
        std::fs::create_dir_all(&self.folder)?;
        std::fs::write(path, serde_json::to_string(contents)?)?;
        Ok(())
    }

    /// Store session state; failures are logged and otherwise ignored
    pub fn save(&self, name: &str, contents: &SessionCache) {
        let path = self.path(name);
        match self.write(&path, contents) {
            Ok(()) => info!("Dumped contents into cache {}", path.display()),
            Err(e) => warn!("Could not save cache {}: {}", path.display(), e),
        }
    }

    pub fn clear(&self, name: &str) {
        let _ = std::fs::remove_file(self.path(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose, Engine};

    fn api_key() -> String {
        let payload = r#"{"iss":"https://test.example.com/auth/realms/main","azp":"api-key-client"}"#;
        format!("e30.{}.sig", general_purpose::URL_SAFE_NO_PAD.encode(payload))
    }

    #[test]
    fn profiles_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load_from(dir.path());
        assert!(config.profile_names().is_empty());

        config.create_profile("prod", &api_key(), None).unwrap();
        config.create_profile("local", &api_key(), Some("http://localhost:8080")).unwrap();
        config.set_default_profile("prod").unwrap();

        let reloaded = Config::load_from(dir.path());
        assert_eq!(reloaded.profile_names(), vec!["local", "prod"]);
        assert_eq!(reloaded.default_profile(), Some("prod"));
        assert_eq!(reloaded.profile("prod").unwrap().root_url, "https://test.example.com");
        assert_eq!(reloaded.profile("local").unwrap().root_url, "http://localhost:8080");
    }

    #[test]
    fn invalid_profiles_are_rejected_or_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load_from(dir.path());
        assert!(matches!(
            config.create_profile("bad", "not-a-token", None),
            Err(NextcodeError::InvalidProfile(_))
        ));
        assert!(matches!(
            config.set_default_profile("missing"),
            Err(NextcodeError::InvalidProfile(_))
        ));

        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[profiles.broken]\napi_key = \"nope\"\n",
        )
        .unwrap();
        assert!(Config::load_from(dir.path()).profile("broken").is_none());
    }

    #[test]
    fn explicit_profile_wins_over_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load_from(dir.path());
        config.create_profile("prod", &api_key(), Some("https://other.example.com")).unwrap();

        let (name, profile) = config.resolve(Some("prod"), Some("ignored"), None).unwrap();
        assert_eq!(name.as_deref(), Some("prod"));
        assert_eq!(profile.root_url, "https://other.example.com");

        let (name, profile) = config.resolve(None, Some(&api_key()), None).unwrap();
        assert!(name.is_none());
        assert_eq!(profile.root_url, "https://test.example.com");

        assert!(config.resolve(Some("missing"), None, None).is_err());
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert!(policy.should_retry_status(503));
        assert!(!policy.should_retry_status(404));
    }

    #[test]
    fn cache_store_persists_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let name = CacheStore::cache_name("queryapi", "https://x/api/query", "key");
        assert_eq!(name.len(), 32);
        assert!(store.load(&name).is_none());

        store.save(
            &name,
            &SessionCache {
                token: Some("tok".into()),
                root_info: serde_json::json!({"endpoints": {}}),
            },
        );
        assert_eq!(store.load(&name).unwrap().token.as_deref(), Some("tok"));
        store.clear(&name);
        assert!(store.load(&name).is_none());
    }
}
