use crate::{
    apis::jobs::{self, JobHandle},
    config::ENV_PROJECT,
    error::{NextcodeError, NextcodeResult},
    models::{AwsCredentials, JobFilter, JobInfo, JobRef, PostJobRequest, ProcessFilter},
    session::{Service, ServiceSession},
};
use log::{debug, info};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

/// Statuses in which a workflow job is still doing work
pub const RUNNING_STATUSES: [&str; 3] = ["PENDING", "STARTED", "RUNNING"];
/// Statuses a workflow job ends in
pub const FINISHED_STATUSES: [&str; 3] = ["COMPLETED", "CANCELLED", "FAILED"];

/// Workflow service API operations
#[derive(Clone)]
pub struct WorkflowApi {
    session: ServiceSession,
    project: Option<String>,
}

impl Service for WorkflowApi {
    fn session(&self) -> &ServiceSession {
        &self.session
    }
}

impl WorkflowApi {
    pub fn new(session: ServiceSession, project: Option<String>) -> Self {
        Self { session, project }
    }

    /// Pipelines available on the server
    pub async fn get_pipelines(&self) -> NextcodeResult<Vec<serde_json::Value>> {
        jobs::list_resource(&self.session, "pipelines").await
    }

    /// Projects that have been created on the server
    pub async fn get_projects(&self) -> NextcodeResult<Vec<serde_json::Value>> {
        jobs::list_resource(&self.session, "projects").await
    }

    /// Find a job by id, or the current user's latest job
    pub async fn find_job(&self, job: impl Into<JobRef>) -> NextcodeResult<WorkflowJob> {
        let info = jobs::find_job(self, job.into()).await?;
        Ok(WorkflowJob::new(self.session.clone(), info))
    }

    /// Jobs satisfying the supplied criteria
    pub async fn get_jobs(&self, filter: &JobFilter) -> NextcodeResult<Vec<WorkflowJob>> {
        let jobs = jobs::list_jobs(&self.session, filter).await?;
        Ok(jobs
            .into_iter()
            .map(|info| WorkflowJob::new(self.session.clone(), info))
            .collect())
    }

    /// Run a workflow job.
    ///
    /// The project defaults to the API's project, then `GOR_API_PROJECT`.
    pub async fn post_job(&self, mut request: PostJobRequest) -> NextcodeResult<WorkflowJob> {
        if request.project_name.is_none() {
            request.project_name = self
                .project
                .clone()
                .or_else(|| std::env::var(ENV_PROJECT).ok().filter(|p| !p.is_empty()));
        }
        if request.project_name.is_none() {
            return Err(NextcodeError::job(
                "No project specified and GOR_API_PROJECT not set in environment",
            ));
        }
        if request.trace {
            let env = request.env.get_or_insert_with(BTreeMap::new);
            env.insert("NXF_DEBUG".to_string(), "3".to_string());
            env.insert("NXF_TRACE".to_string(), "nextflow".to_string());
        }
        debug!("post_job called with {:?}", request);

        let url = self.session.url_from_endpoint("jobs").await?;
        let req = self.session.request(Method::POST, &url)?.json(&request);
        let info: JobInfo = self.session.execute(req).await?;
        info!("Workflow job {} has been created", info.job_id);
        Ok(WorkflowJob::new(self.session.clone(), info))
    }
}

/// Parse `upload=joe` style pairs into a map of forwarded name to local profile name
pub fn parse_credential_map<S: AsRef<str>>(pairs: &[S]) -> NextcodeResult<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let pair = pair.as_ref();
            pair.split_once('=')
                .filter(|(k, v)| !k.is_empty() && !v.is_empty() && !v.contains('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| NextcodeError::invalid_param(format!("Invalid credential mapping '{}'", pair)))
        })
        .collect()
}

/// Build the credentials payload for [`PostJobRequest::credentials`]
pub fn credential_struct(
    mapping: &BTreeMap<String, String>,
    lookup: impl Fn(&str) -> NextcodeResult<AwsCredentials>,
) -> NextcodeResult<BTreeMap<String, AwsCredentials>> {
    mapping
        .iter()
        .map(|(upload_name, local_name)| Ok((upload_name.clone(), lookup(local_name)?)))
        .collect()
}

#[derive(Deserialize)]
struct ProcessList {
    processes: Vec<serde_json::Value>,
}

/// Proxy object for a server-side workflow job
#[derive(Clone)]
pub struct WorkflowJob {
    handle: JobHandle,
}

impl WorkflowJob {
    pub(crate) fn new(session: ServiceSession, info: JobInfo) -> Self {
        Self {
            handle: JobHandle::new(session, info),
        }
    }

    pub fn job_id(&self) -> i64 {
        self.handle.info.job_id
    }

    pub fn status(&self) -> &str {
        self.handle.status()
    }

    /// Last known server representation
    pub fn info(&self) -> &JobInfo {
        &self.handle.info
    }

    /// Elapsed time of the job, truncated to whole seconds
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.handle.duration(RUNNING_STATUSES.contains(&self.status()))
    }

    /// Is the job currently running; `force` refreshes from the server first
    pub async fn is_running(&mut self, force: bool) -> NextcodeResult<bool> {
        if force {
            self.refresh().await?;
        }
        Ok(RUNNING_STATUSES.contains(&self.status()))
    }

    /// Has the job finished; `force` refreshes from the server first
    pub async fn is_finished(&mut self, force: bool) -> NextcodeResult<bool> {
        if force {
            self.refresh().await?;
        }
        Ok(FINISHED_STATUSES.contains(&self.status()))
    }

    /// Refresh the local copy of the server-side job
    pub async fn refresh(&mut self) -> NextcodeResult<()> {
        self.handle.refresh().await
    }

    /// Rerun a job that has previously failed
    pub async fn resume(&mut self) -> NextcodeResult<()> {
        let url = self.handle.self_link()?;
        let req = self.handle.session.request(Method::PUT, &url)?;
        self.handle.session.send(req).await?;
        self.refresh().await
    }

    /// Cancel a running job. Returns the status message from the server.
    pub async fn cancel(
        &self,
        status: Option<&str>,
        status_message: Option<&str>,
    ) -> NextcodeResult<Option<String>> {
        self.handle.cancel(status, status_message).await
    }

    /// Inspect a failed job for debugging
    pub async fn inspect(&self) -> NextcodeResult<serde_json::Value> {
        let url = self
            .handle
            .info
            .links
            .inspect
            .clone()
            .ok_or_else(|| NextcodeError::server("Server does not support inspect functionality"))?;
        self.handle.session.get_json(&url).await
    }

    /// Nextflow processes in this job
    pub async fn processes(&self, filter: &ProcessFilter) -> NextcodeResult<Vec<serde_json::Value>> {
        let mut url = self
            .handle
            .link("processes", self.handle.info.links.processes.as_ref())?;
        let session = &self.handle.session;
        if let Some(process_id) = filter.process_id {
            url.push_str(&format!("/{}", process_id));
            let process: serde_json::Value = session.get_json(&url).await?;
            return Ok(vec![process]);
        }

        let mut data = json!({ "limit": filter.limit });
        if filter.all {
            data["all"] = json!(1);
        }
        if let Some(status) = &filter.status {
            data["status"] = json!(status);
        }
        let req = session.request(Method::GET, &url)?.json(&data);
        let list: ProcessList = session.execute(req).await?;
        Ok(list.processes)
    }

    /// Events reported by Nextflow for this job
    pub async fn events(&self, limit: u32) -> NextcodeResult<Vec<serde_json::Value>> {
        self.handle.events(limit).await
    }

    /// Log group names mapped to their URLs
    pub async fn log_groups(&self) -> NextcodeResult<Vec<(String, String)>> {
        self.handle.log_groups().await
    }

    /// Text logs for the first log group whose name starts with `log_group`
    pub async fn logs(&self, log_group: &str, log_filter: Option<&str>) -> NextcodeResult<String> {
        self.handle.logs(log_group, log_filter).await
    }
}

impl std::fmt::Debug for WorkflowApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowApi")
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for WorkflowJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Workflow Job {} ({})>", self.job_id(), self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_pairs() {
        let map = parse_credential_map(&["upload=joe", "download=default"]).unwrap();
        assert_eq!(map.get("upload").map(String::as_str), Some("joe"));
        assert_eq!(map.len(), 2);
        assert!(parse_credential_map(&["nonsense"]).is_err());
        assert!(parse_credential_map(&["a=b=c"]).is_err());
    }

    #[test]
    fn credential_struct_uses_lookup() {
        let map = parse_credential_map(&["upload=joe"]).unwrap();
        let creds = credential_struct(&map, |profile| {
            Ok(AwsCredentials {
                aws_access_key_id: format!("{}-id", profile),
                aws_secret_access_key: "secret".into(),
                region: None,
            })
        })
        .unwrap();
        assert_eq!(creds["upload"].aws_access_key_id, "joe-id");
    }
}
