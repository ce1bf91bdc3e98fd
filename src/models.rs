use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::NextcodeError;

/// Document returned by the root endpoint of every service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootInfo {
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    pub current_user: Option<serde_json::Value>,
    pub build_info: Option<serde_json::Value>,
    pub app_info: Option<serde_json::Value>,
    pub service_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RootInfo {
    /// Email of the user the service decoded from our token
    pub fn current_user_email(&self) -> Option<&str> {
        self.current_user
            .as_ref()
            .and_then(|u| u.get("email"))
            .and_then(|e| e.as_str())
    }
}

/// Service information from the root endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub build_info: Option<serde_json::Value>,
    pub app_info: Option<serde_json::Value>,
    pub service_name: Option<String>,
    pub root: Option<String>,
}

// ---- query service ----

/// Lifecycle states of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryStatus {
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Failed,
    Done,
    Expired,
    #[serde(other)]
    Unknown,
}

impl QueryStatus {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Cancelling)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::Cancelling | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::Done => "DONE",
            Self::Expired => "EXPIRED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Named link, e.g. a template perspective
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedLink {
    pub name: String,
    pub href: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryLinks {
    #[serde(rename = "self")]
    pub self_link: String,
    pub result: Option<String>,
    pub streamresults: Option<String>,
    pub perspectives: Option<Vec<NamedLink>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryStats {
    pub submit_timestamp: Option<f64>,
    pub end_timestamp: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Server-side representation of a query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryInfo {
    pub query_id: i64,
    pub status: QueryStatus,
    pub links: QueryLinks,
    pub submit_date: Option<String>,
    pub query: Option<String>,
    pub line_count: Option<u64>,
    pub available: Option<bool>,
    pub status_message: Option<String>,
    pub stats: Option<QueryStats>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Compact JSON result set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    #[serde(default)]
    pub header: Vec<String>,
    #[serde(default)]
    pub data: Vec<Vec<serde_json::Value>>,
}

/// Parameters for fetching query results
#[derive(Debug, Clone, Default)]
pub struct ResultOptions {
    /// Number of rows to return (default all)
    pub limit: Option<u64>,
    /// Number of rows to skip
    pub offset: Option<u64>,
    /// Sort string in the form `[column] [ASC|DESC]`
    pub sort: Option<String>,
    /// Server-side filter
    pub filter: Option<String>,
    /// Perspective to apply (template queries only)
    pub perspective: Option<String>,
    /// Rows requested per call, 1,000,000 when not set
    pub page_size: Option<u64>,
}

/// Query template description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: Option<String>,
    pub full_name: Option<String>,
    #[serde(default)]
    pub links: BTreeMap<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---- workflow and pipelines services ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobLinks {
    #[serde(rename = "self")]
    pub self_link: Option<String>,
    pub logs: Option<String>,
    pub events: Option<String>,
    pub inspect: Option<String>,
    pub processes: Option<String>,
    pub steps: Option<String>,
    pub instances: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Server-side representation of a workflow or pipeline job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: i64,
    pub status: Option<String>,
    #[serde(default)]
    pub links: JobLinks,
    pub status_message: Option<String>,
    pub pipeline_name: Option<String>,
    pub project_name: Option<String>,
    pub user_name: Option<String>,
    pub submit_date: Option<String>,
    pub complete_date: Option<String>,
    pub status_date: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Reference to a job: a numeric id or the current user's latest job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRef {
    Id(i64),
    Latest,
}

impl FromStr for JobRef {
    type Err = NextcodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "latest" {
            return Ok(Self::Latest);
        }
        s.trim().parse().map(Self::Id).map_err(|_| {
            NextcodeError::NotFound(format!("job_id must be an integer or 'latest', not '{}'", s))
        })
    }
}

impl From<i64> for JobRef {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

/// Criteria for listing jobs
#[derive(Debug, Clone, Serialize)]
pub struct JobFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "project_name", skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(rename = "pipeline_name", skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    /// Workflow only: each state groups several statuses (running, finished)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Workflow only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub limit: Option<u32>,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            user_name: None,
            status: None,
            project: None,
            pipeline: None,
            state: None,
            context: None,
            limit: Some(50),
        }
    }
}

/// Access keys forwarded to the workflow service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsCredentials {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Body of `POST /jobs` on the workflow service
#[derive(Debug, Clone, Default, Serialize)]
pub struct PostJobRequest {
    pub pipeline_name: Option<String>,
    pub project_name: Option<String>,
    #[serde(rename = "parameters")]
    pub params: Option<serde_json::Value>,
    /// Git repository url (development servers only)
    pub script: Option<String>,
    pub revision: Option<String>,
    pub build_context: Option<String>,
    pub profile: Option<String>,
    pub details: Option<serde_json::Value>,
    pub description: Option<String>,
    pub context: Option<String>,
    pub features: Option<serde_json::Value>,
    /// `builtin`, `git` or `url`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedicated_storage_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<BTreeMap<String, AwsCredentials>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub keep_resources: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mount_jobs: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    /// Run nextflow with trace flags
    #[serde(skip)]
    pub trace: bool,
}

/// Criteria for listing the nextflow processes of a workflow job
#[derive(Debug, Clone)]
pub struct ProcessFilter {
    pub process_id: Option<i64>,
    /// Include finished processes, not just running ones
    pub all: bool,
    pub limit: u32,
    pub status: Option<String>,
}

impl Default for ProcessFilter {
    fn default() -> Self {
        Self {
            process_id: None,
            all: false,
            limit: 50,
            status: None,
        }
    }
}
