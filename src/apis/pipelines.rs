use crate::{
    apis::jobs::{self, JobHandle},
    error::{NextcodeError, NextcodeResult},
    models::{JobFilter, JobInfo, JobRef},
    session::{Service, ServiceSession},
    utils::smart_cast,
};

pub const RUNNING_STATUSES: [&str; 4] = ["QUEUED", "LAUNCHING", "INITIALIZING", "RUNNING"];
pub const FAILED_STATUSES: [&str; 2] = ["FAILED", "TERMINATED"];
pub const FINISHED_STATUSES: [&str; 3] = ["FINISHED", "CANCELLED", "COMPLETED"];
pub const DONE_STATUS: &str = "COMPLETED";

/// Pipelines service API operations
#[derive(Clone)]
pub struct PipelinesApi {
    session: ServiceSession,
}

impl Service for PipelinesApi {
    fn session(&self) -> &ServiceSession {
        &self.session
    }
}

impl PipelinesApi {
    pub fn new(session: ServiceSession) -> Self {
        Self { session }
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
    pub async fn find_job(&self, job: impl Into<JobRef>) -> NextcodeResult<PipelineJob> {
        let info = jobs::find_job(self, job.into()).await?;
        Ok(PipelineJob::new(self.session.clone(), info))
    }

    /// Jobs satisfying the supplied criteria. `state` and `context` are not used by this service.
    pub async fn get_jobs(&self, filter: &JobFilter) -> NextcodeResult<Vec<PipelineJob>> {
        let filter = JobFilter {
            state: None,
            context: None,
            ..filter.clone()
        };
        let jobs = jobs::list_jobs(&self.session, &filter).await?;
        Ok(jobs
            .into_iter()
            .map(|info| PipelineJob::new(self.session.clone(), info))
            .collect())
    }
}

/// Proxy object for a server-side pipeline job.
///
/// Status checks refresh from the server for as long as the job is running.
#[derive(Clone)]
pub struct PipelineJob {
    handle: JobHandle,
}

impl PipelineJob {
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

    pub fn info(&self) -> &JobInfo {
        &self.handle.info
    }

    fn running_locally(&self) -> bool {
        RUNNING_STATUSES.contains(&self.status())
    }

    /// Elapsed time of the job, truncated to whole seconds
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.handle.duration(self.running_locally())
    }

    async fn refresh_if_running(&mut self) -> NextcodeResult<()> {
        if self.running_locally() {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Has the job finished (might be failed)
    pub async fn is_finished(&mut self) -> NextcodeResult<bool> {
        self.refresh_if_running().await?;
        Ok(FINISHED_STATUSES.contains(&self.status()))
    }

    pub async fn is_running(&mut self) -> NextcodeResult<bool> {
        self.refresh_if_running().await?;
        Ok(self.running_locally())
    }

    pub async fn is_failed(&mut self) -> NextcodeResult<bool> {
        self.refresh_if_running().await?;
        Ok(FAILED_STATUSES.contains(&self.status()))
    }

    /// Has the job completed successfully
    pub async fn is_done(&mut self) -> NextcodeResult<bool> {
        self.refresh_if_running().await?;
        Ok(self.status() == DONE_STATUS)
    }

    pub async fn refresh(&mut self) -> NextcodeResult<()> {
        self.handle.refresh().await
    }

    /// Cancel a running job. Returns the status message from the server.
    pub async fn cancel(
        &self,
        status: Option<&str>,
        status_message: Option<&str>,
    ) -> NextcodeResult<Option<String>> {
        self.handle.cancel(status, status_message).await
    }

    /// Steps of this job with numeric fields converted to numbers
    pub async fn steps(&self) -> NextcodeResult<Vec<serde_json::Map<String, serde_json::Value>>> {
        let url = self.handle.link("steps", self.handle.info.links.steps.as_ref())?;
        let steps: Vec<serde_json::Map<String, serde_json::Value>> =
            self.handle.session.get_json(&url).await?;
        Ok(steps
            .into_iter()
            .map(|step| {
                step.into_iter()
                    .map(|(k, v)| {
                        let v = smart_cast(&k, v);
                        (k, v)
                    })
                    .collect()
            })
            .collect())
    }

    /// Instance information for this job
    pub async fn instance(&self) -> NextcodeResult<serde_json::Value> {
        let url = self
            .handle
            .link("instances", self.handle.info.links.instances.as_ref())?;
        let instances: Vec<serde_json::Value> = self.handle.session.get_json(&url).await?;
        let instance_url = instances
            .first()
            .and_then(|i| i.pointer("/links/self"))
            .and_then(|u| u.as_str())
            .ok_or_else(|| NextcodeError::NotFound(format!("Job {} has no instances", self.job_id())))?;
        self.handle.session.get_json(instance_url).await
    }

    /// Events reported for this job
    pub async fn events(&self, limit: u32) -> NextcodeResult<Vec<serde_json::Value>> {
        self.handle.events(limit).await
    }

    pub async fn log_groups(&self) -> NextcodeResult<Vec<(String, String)>> {
        self.handle.log_groups().await
    }

    /// Text logs for a log group, `pod` when not given
    pub async fn logs(&self, log_group: Option<&str>, log_filter: Option<&str>) -> NextcodeResult<String> {
        self.handle.logs(log_group.unwrap_or("pod"), log_filter).await
    }
}

impl std::fmt::Debug for PipelineJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Pipeline Job {} ({})>", self.job_id(), self.status())
    }
}
