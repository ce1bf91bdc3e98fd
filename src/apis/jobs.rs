use crate::{
    error::{NextcodeError, NextcodeResult},
    models::{JobFilter, JobInfo, JobRef},
    session::{Service, ServiceSession},
    utils::parse_timestamp,
};
use chrono::{Duration, Utc};
use log::{debug, info};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;

#[derive(Deserialize)]
struct JobList {
    jobs: Vec<JobInfo>,
}

#[derive(Deserialize)]
struct LogGroups {
    links: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct EventList {
    events: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct CancelResponse {
    status_message: Option<String>,
}

/// List resources exported under a named endpoint, e.g. `pipelines` or `projects`
pub(crate) async fn list_resource(session: &ServiceSession, endpoint: &str) -> NextcodeResult<Vec<serde_json::Value>> {
    let url = session.url_from_endpoint(endpoint).await?;
    let body: serde_json::Value = session.get_json(&url).await?;
    body.get(endpoint)
        .and_then(|v| v.as_array())
        .cloned()
        .ok_or_else(|| NextcodeError::InvalidResponse(format!("Missing '{}' in response", endpoint)))
}

pub(crate) async fn find_job<S: Service + ?Sized>(service: &S, job: JobRef) -> NextcodeResult<JobInfo> {
    let session = service.session();
    let url = session.url_from_endpoint("jobs").await?;
    let mut data = json!({ "limit": 1 });
    match job {
        JobRef::Latest => {
            let email = session.root_info().await.current_user_email().map(str::to_string);
            data["user_name"] = json!(email);
        }
        JobRef::Id(id) => data["job_id"] = json!(id),
    }
    let req = session.request(Method::GET, &url)?.json(&data);
    let list: JobList = session.execute(req).await?;
    list.jobs
        .into_iter()
        .next()
        .ok_or_else(|| NextcodeError::NotFound("Job not found".to_string()))
}

pub(crate) async fn list_jobs(session: &ServiceSession, filter: &JobFilter) -> NextcodeResult<Vec<JobInfo>> {
    let url = session.url_from_endpoint("jobs").await?;
    let started = Instant::now();
    let req = session.request(Method::GET, &url)?.json(filter);
    let list: JobList = session.execute(req).await?;
    info!(
        "Retrieved {} jobs in {:.2} sec",
        list.jobs.len(),
        started.elapsed().as_secs_f64()
    );
    Ok(list.jobs)
}

/// State and links shared by workflow and pipeline job proxies
#[derive(Clone)]
pub(crate) struct JobHandle {
    pub(crate) session: ServiceSession,
    pub(crate) info: JobInfo,
}

impl JobHandle {
    pub(crate) fn new(session: ServiceSession, info: JobInfo) -> Self {
        Self { session, info }
    }

    pub(crate) fn link(&self, name: &str, link: Option<&String>) -> NextcodeResult<String> {
        link.cloned().ok_or_else(|| {
            NextcodeError::server(format!("Job {} has no '{}' link", self.info.job_id, name))
        })
    }

    pub(crate) fn self_link(&self) -> NextcodeResult<String> {
        self.link("self", self.info.links.self_link.as_ref())
    }

    pub(crate) fn status(&self) -> &str {
        self.info.status.as_deref().unwrap_or("")
    }

    pub(crate) async fn refresh(&mut self) -> NextcodeResult<()> {
        let url = self.self_link()?;
        self.info = self.session.get_json(&url).await?;
        Ok(())
    }

    pub(crate) async fn cancel(
        &self,
        status: Option<&str>,
        status_message: Option<&str>,
    ) -> NextcodeResult<Option<String>> {
        let url = self.self_link()?;
        let data = json!({
            "status": status.unwrap_or("CANCELLED"),
            "status_message": status_message,
        });
        let req = self.session.request(Method::DELETE, &url)?.json(&data);
        let resp: CancelResponse = self.session.execute(req).await?;
        Ok(resp.status_message)
    }

    pub(crate) async fn events(&self, limit: u32) -> NextcodeResult<Vec<serde_json::Value>> {
        let url = self.link("events", self.info.links.events.as_ref())?;
        let req = self
            .session
            .request(Method::GET, &url)?
            .json(&json!({ "limit": limit }));
        let list: EventList = self.session.execute(req).await?;
        Ok(list.events)
    }

    /// Log group names and URLs in the order the server lists them
    pub(crate) async fn log_groups(&self) -> NextcodeResult<Vec<(String, String)>> {
        let url = self.link("logs", self.info.links.logs.as_ref())?;
        let groups: LogGroups = self.session.get_json(&url).await?;
        Ok(groups
            .links
            .into_iter()
            .filter_map(|(name, url)| url.as_str().map(|u| (name, u.to_string())))
            .collect())
    }

    pub(crate) async fn logs(&self, log_group: &str, log_filter: Option<&str>) -> NextcodeResult<String> {
        let groups = self.log_groups().await?;
        let mut url = groups
            .into_iter()
            .find(|(name, _)| name.starts_with(log_group))
            .map(|(_, url)| url)
            .ok_or_else(|| NextcodeError::server(format!("Log Group '{}' is not available.", log_group)))?;
        if let Some(filter) = log_filter {
            url.push_str(&format!("?filter={}", urlencoding::encode(filter)));
        }
        debug!("Fetching logs from {}", url);
        let req = self.session.request(Method::GET, &url)?;
        self.session.execute_text(req).await
    }

    /// Elapsed time from submission to completion (or now while running), whole seconds
    pub(crate) fn duration(&self, running: bool) -> Option<Duration> {
        let submitted = self.info.submit_date.as_deref().and_then(parse_timestamp)?;
        let end = match self.info.complete_date.as_deref().and_then(parse_timestamp) {
            Some(end) => end,
            None if running => Utc::now(),
            None => self.info.status_date.as_deref().and_then(parse_timestamp)?,
        };
        Some(Duration::seconds((end - submitted).num_seconds()))
    }
}
