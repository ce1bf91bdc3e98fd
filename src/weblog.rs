//! Progress reporting from inside a running workflow job.
//!
//! Jobs get the address of their weblog endpoint in `WEBLOG_URL`; without
//! it every call logs a warning and does nothing.

use crate::error::NextcodeResult;
use log::warn;
use reqwest::Client;
use serde_json::json;

pub const ENV_WEBLOG_URL: &str = "WEBLOG_URL";

/// Client for the job's weblog endpoint
#[derive(Debug, Clone)]
pub struct Weblog {
    client: Client,
    url: Option<String>,
}

impl Weblog {
    pub fn new(client: Client, url: Option<String>) -> Self {
        Self { client, url }
    }

    /// Weblog for the job described by the environment
    pub fn from_env() -> Self {
        let url = std::env::var(ENV_WEBLOG_URL).ok().filter(|u| !u.is_empty());
        Self::new(Client::new(), url)
    }

    async fn post(&self, contents: serde_json::Value) -> NextcodeResult<()> {
        let Some(url) = &self.url else {
            warn!("No weblog url set. Cannot send message");
            return Ok(());
        };
        self.client
            .post(url)
            .json(&contents)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Append `value` to the list under `key` in the job details
    pub async fn add_to_details(&self, key: &str, value: serde_json::Value) -> NextcodeResult<()> {
        self.post(json!({
            "event": "custom_details_add",
            "details": { "key": key, "value": value },
        }))
        .await
    }

    /// Set `key` in the job details to `value`
    pub async fn set_details(&self, key: &str, value: serde_json::Value) -> NextcodeResult<()> {
        self.post(json!({
            "event": "custom_details_set",
            "details": { "key": key, "value": value },
        }))
        .await
    }

    /// Set the status message of the job
    pub async fn set_status_message(&self, message: &str) -> NextcodeResult<()> {
        self.post(json!({
            "event": "custom_status_message",
            "details": { "message": message },
        }))
        .await
    }
}
