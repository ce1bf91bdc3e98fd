use crate::{
    error::{NextcodeError, NextcodeResult},
    models::{QueryInfo, QueryLinks, QueryStatus, ResultOptions, ResultSet, Template},
    session::{Service, ServiceSession},
    template::VirtualRelation,
};
use futures_util::StreamExt;
use log::{debug, info};
use reqwest::{header::ACCEPT, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// Seconds the server waits for a query to finish before answering a submission
pub const QUERY_WAIT_SECONDS: u64 = 2;
/// Rows requested per page when fetching results, unless [`ResultOptions::page_size`] is set
pub const RESULTS_PAGE_SIZE: u64 = 1_000_000;
const MAX_POLL_PERIOD: Duration = Duration::from_secs(10);
const POLL_STEP: Duration = Duration::from_millis(500);

const ACCEPT_COMPACT_JSON: &str = "application/json+compact";
const ACCEPT_TSV: &str = "text/tab-separated-values";

/// Options for [`QueryApi::execute`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Return right after submission instead of waiting for the query to finish
    pub nowait: bool,
    /// Project path to persist the results to (must start with `user_data/`)
    pub persist: Option<String>,
    /// Virtual relations referenced by the statement
    pub relations: Vec<VirtualRelation>,
    /// Job type used for routing
    pub job_type: Option<String>,
}

#[derive(Deserialize)]
struct QueryList {
    queries: Vec<QueryInfo>,
}

fn self_link(item: &serde_json::Value) -> Option<String> {
    item.pointer("/links/self")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Query API operations
#[derive(Clone)]
pub struct QueryApi {
    session: ServiceSession,
    project: Option<String>,
    metadata: serde_json::Value,
}

impl Service for QueryApi {
    fn session(&self) -> &ServiceSession {
        &self.session
    }
}

impl QueryApi {
    pub fn new(session: ServiceSession, project: Option<String>) -> Self {
        Self {
            session,
            project,
            metadata: json!({ "client": concat!("nextcode-rust-sdk/", env!("CARGO_PKG_VERSION")) }),
        }
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    fn check_project(&self) -> NextcodeResult<&str> {
        self.project
            .as_deref()
            .ok_or_else(|| NextcodeError::query("No project specified"))
    }

    async fn templates_url(&self) -> NextcodeResult<String> {
        self.session.url_from_endpoint("templates").await
    }

    /// Fetch a template by its full name `[organization]/[category]/[name]/[version]`
    pub async fn get_template(&self, name: &str) -> NextcodeResult<Template> {
        let url = format!("{}{}", self.templates_url().await?, name);
        self.session.get_json(&url).await
    }

    /// All templates, optionally filtered, keyed by full name
    pub async fn get_templates(
        &self,
        organization: Option<&str>,
        category: Option<&str>,
        name: Option<&str>,
    ) -> NextcodeResult<BTreeMap<String, Template>> {
        let root = self.templates_url().await?;
        let org_links = match organization {
            Some(org) => vec![format!("{}{}/", root, org)],
            None => {
                let body: serde_json::Value = self.session.get_json(&root).await?;
                body["organizations"]
                    .as_array()
                    .map(|orgs| orgs.iter().filter_map(self_link).collect())
                    .unwrap_or_default()
            }
        };

        let mut ret = BTreeMap::new();
        for org_link in org_links {
            let category_links: Vec<String> = match category {
                Some(cat) => vec![format!("{}{}/", org_link, cat)],
                None => {
                    let body: serde_json::Value = self.session.get_json(&org_link).await?;
                    body["categories"]
                        .as_array()
                        .map(|cats| cats.iter().filter_map(self_link).collect())
                        .unwrap_or_default()
                }
            };

            for link in category_links {
                let body: serde_json::Value = match self.session.get_json(&link).await {
                    Ok(body) => body,
                    Err(NextcodeError::Server { .. }) => continue,
                    Err(e) => return Err(e),
                };
                let templates: Vec<Template> =
                    serde_json::from_value(body["templates"].clone()).unwrap_or_default();
                for template in templates {
                    if name.is_some() && template.name.as_deref() != name {
                        continue;
                    }
                    if let Some(full_name) = template.full_name.clone() {
                        ret.insert(full_name, template);
                    }
                }
            }
        }
        Ok(ret)
    }

    /// Execute a statement on the server
    pub async fn execute(&self, statement: &str, options: ExecuteOptions) -> NextcodeResult<Query> {
        let project = self.check_project()?;
        let url = self.session.url_from_endpoint("queries").await?;
        let relations = options
            .relations
            .iter()
            .map(VirtualRelation::normalized)
            .collect::<NextcodeResult<Vec<_>>>()?;

        let payload = json!({
            "project": project,
            "query": statement,
            "relations": relations,
            "persist": options.persist,
            "wait": QUERY_WAIT_SECONDS,
            "metadata": self.metadata,
            "type": options.job_type,
        });
        let req = self.session.request(Method::POST, &url)?.json(&payload);
        let info: QueryInfo = match self.session.execute(req).await {
            Ok(info) => info,
            Err(e) if e.status() == Some(StatusCode::CONFLICT.as_u16()) => {
                let names = e
                    .response()
                    .and_then(|r| r.pointer("/error/virtual_relations"))
                    .and_then(|v| v.as_array())
                    .map(|rels| {
                        rels.iter()
                            .filter_map(|r| r.get("name").and_then(|n| n.as_str()))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                return Err(NextcodeError::MissingRelations(names));
            }
            Err(e) => return Err(e),
        };

        let mut query = Query::new(self.session.clone(), info);
        info!(
            "Query {} has been created and has status {}",
            query.query_id(),
            query.status()
        );
        if !options.nowait {
            query.wait(None, POLL_STEP).await?;
        }
        Ok(query)
    }

    /// Execute a template; `args` are passed to the template as arguments
    pub async fn execute_template(
        &self,
        template_name: &str,
        args: &[(&str, serde_json::Value)],
        nowait: bool,
    ) -> NextcodeResult<Query> {
        let project = self.check_project()?;
        let template = match self.get_template(template_name).await {
            Ok(template) => template,
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND.as_u16()) => {
                return Err(NextcodeError::query(format!("Template {} not found", template_name)))
            }
            Err(e) => return Err(e),
        };
        let execute_url = template
            .links
            .get("execute")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NextcodeError::InvalidResponse(format!("Template {} cannot be executed", template_name)))?;

        let args: Vec<serde_json::Value> = args
            .iter()
            .map(|(k, v)| {
                let mut arg = serde_json::Map::new();
                arg.insert(k.to_string(), v.clone());
                serde_json::Value::Object(arg)
            })
            .collect();
        let payload = json!({
            "project": project,
            "args": args,
            "wait": QUERY_WAIT_SECONDS,
            "metadata": self.metadata,
        });
        let req = self.session.request(Method::POST, execute_url)?.json(&payload);
        let info: QueryInfo = self.session.execute(req).await?;

        let mut query = Query::new(self.session.clone(), info);
        info!(
            "Template Query {} has been created and has status {}",
            query.query_id(),
            query.status()
        );
        if !nowait {
            query.wait(None, POLL_STEP).await?;
        }
        Ok(query)
    }

    /// A query that has been previously executed
    pub async fn get_query(&self, query_id: i64) -> NextcodeResult<Query> {
        self.check_project()?;
        let url = format!("{}{}", self.session.url_from_endpoint("queries").await?, query_id);
        match self.session.get_json::<QueryInfo>(&url).await {
            Ok(info) => Ok(Query::new(self.session.clone(), info)),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND.as_u16()) => {
                Err(NextcodeError::query(format!("Query {} not found", query_id)))
            }
            Err(e) => Err(NextcodeError::Query {
                message: e.to_string(),
                query_id: Some(query_id),
            }),
        }
    }

    /// Queries run by the current user in the current project, latest first.
    ///
    /// The returned objects may be partial; call [`Query::refresh`] for full details.
    pub async fn get_queries(&self, status: Option<&str>, limit: u32) -> NextcodeResult<Vec<Query>> {
        let project = self.check_project()?;
        let user_name = self.session.root_info().await.current_user_email().map(str::to_string);
        let url = self.session.url_from_endpoint("queries").await?;
        let data = json!({
            "project": project,
            "user_name": user_name,
            "limit": limit,
            "status": status,
        });
        let req = self.session.request(Method::GET, &url)?.json(&data);
        let list: QueryList = self.session.execute(req).await?;
        Ok(list
            .queries
            .into_iter()
            .map(|info| Query::new(self.session.clone(), info))
            .collect())
    }
}

/// Local proxy for a server-side query
#[derive(Clone)]
pub struct Query {
    session: ServiceSession,
    info: QueryInfo,
}

impl Query {
    pub(crate) fn new(session: ServiceSession, info: QueryInfo) -> Self {
        Self { session, info }
    }

    pub fn query_id(&self) -> i64 {
        self.info.query_id
    }

    pub fn status(&self) -> QueryStatus {
        self.info.status
    }

    /// Last known server representation
    pub fn info(&self) -> &QueryInfo {
        &self.info
    }

    pub fn line_count(&self) -> u64 {
        self.info.line_count.unwrap_or(0)
    }

    /// Server-side execution time in seconds, once the query has ended
    pub fn duration(&self) -> Option<f64> {
        let stats = self.info.stats.as_ref()?;
        Some(stats.end_timestamp? - stats.submit_timestamp?)
    }

    /// Submission time
    pub fn submit_date(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.info
            .submit_date
            .as_deref()
            .and_then(crate::utils::parse_timestamp)
    }

    /// Perspectives available for this query (template queries only)
    pub fn perspectives(&self) -> Vec<String> {
        self.info
            .links
            .perspectives
            .as_ref()
            .map(|p| p.iter().map(|l| l.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Refresh the local copy from the server
    pub async fn refresh(&mut self) -> NextcodeResult<()> {
        let url = self.info.links.self_link.clone();
        self.info = self.session.get_json(&url).await?;
        Ok(())
    }

    async fn refresh_if_running(&mut self) -> NextcodeResult<QueryStatus> {
        if self.info.status.is_running() {
            self.refresh().await?;
        }
        Ok(self.info.status)
    }

    pub async fn is_running(&mut self) -> NextcodeResult<bool> {
        Ok(self.refresh_if_running().await?.is_running())
    }

    pub async fn is_failed(&mut self) -> NextcodeResult<bool> {
        Ok(self.refresh_if_running().await?.is_failed())
    }

    pub async fn is_done(&mut self) -> NextcodeResult<bool> {
        Ok(self.refresh_if_running().await? == QueryStatus::Done)
    }

    /// Poll until the query leaves the running states.
    ///
    /// The poll period grows by half a second per poll, up to ten seconds.
    /// Fails if the query is still running after `max_wait`.
    pub async fn wait(&mut self, max_wait: Option<Duration>, poll_period: Duration) -> NextcodeResult<&mut Self> {
        if !self.is_running().await? {
            return Ok(self);
        }
        info!("Waiting for query {} to complete...", self.query_id());
        let started = Instant::now();
        let mut period = poll_period.min(MAX_POLL_PERIOD);

        while self.info.status.is_running() {
            tokio::time::sleep(period).await;
            let still_running = self.is_running().await?;
            if still_running && max_wait.is_some_and(|max| started.elapsed() > max) {
                return Err(NextcodeError::Query {
                    message: format!(
                        "Query {} has exceeded wait time {}s and we will not wait any longer. It is currently {}.",
                        self.query_id(),
                        max_wait.map(|m| m.as_secs()).unwrap_or_default(),
                        self.status()
                    ),
                    query_id: Some(self.query_id()),
                });
            }
            period = (period + POLL_STEP).min(MAX_POLL_PERIOD);
        }

        let elapsed = started.elapsed().as_secs_f64();
        if self.status() == QueryStatus::Done {
            info!(
                "Query {} completed in {:.2} sec and generated {} rows",
                self.query_id(),
                elapsed,
                self.line_count()
            );
        } else {
            info!("Query {} has status {} after {:.2} sec", self.query_id(), self.status(), elapsed);
        }
        Ok(self)
    }

    fn check_results_available(&self) -> NextcodeResult<String> {
        if self.status() != QueryStatus::Done {
            return Err(NextcodeError::Query {
                message: format!("Query {} is {}", self.query_id(), self.status()),
                query_id: Some(self.query_id()),
            });
        }
        if self.info.available == Some(false) {
            return Err(NextcodeError::Query {
                message: format!("Query results for query {} are not available", self.query_id()),
                query_id: Some(self.query_id()),
            });
        }
        self.info.links.result.clone().ok_or_else(|| {
            NextcodeError::InvalidResponse(format!("Query {} has no result link", self.query_id()))
        })
    }

    /// Fetch results page by page; returns one response per page.
    ///
    /// Queries listed by [`QueryApi::get_queries`] lack the row count and
    /// availability, so they are refreshed first.
    async fn fetch_pages(&mut self, options: &ResultOptions, accept: &str) -> NextcodeResult<Vec<reqwest::Response>> {
        if self.info.line_count.is_none() || self.info.available.is_none() {
            debug!("Query {} is missing result details, refreshing", self.query_id());
            self.refresh().await?;
        }
        let url = self.check_results_available()?;
        let started = Instant::now();
        let page_size = options.page_size.filter(|n| *n > 0).unwrap_or(RESULTS_PAGE_SIZE);
        let offset = options.offset.unwrap_or(0);
        let available = self.line_count().saturating_sub(offset);
        let to_fetch = options.limit.map_or(available, |limit| limit.min(available));
        if to_fetch > page_size {
            info!("Requesting {} rows in {} rows per page...", to_fetch, page_size);
        }

        let mut pages = Vec::new();
        let mut received = 0u64;
        let mut skip_header = false;
        while received < to_fetch {
            let this_time = (to_fetch - received).min(page_size);
            let data = json!({
                "limit": this_time,
                "offset": offset + received,
                "sort": options.sort,
                "skipheader": skip_header,
                "filt": options.filter,
                "perspective": options.perspective,
            });
            skip_header = true;
            let page_started = Instant::now();
            let req = self
                .session
                .request(Method::GET, &url)?
                .header(ACCEPT, accept)
                .json(&data);
            pages.push(self.session.send(req).await?);
            received += this_time;
            debug!(
                "Fetched {} rows this time in {:.1}sec. Received {}/{} rows",
                this_time,
                page_started.elapsed().as_secs_f64(),
                received,
                to_fetch
            );
        }
        info!(
            "Retrieved {} rows from server in {:.2} sec",
            received,
            started.elapsed().as_secs_f64()
        );
        Ok(pages)
    }

    /// Results of a completed query as a compact JSON result set
    pub async fn get_results(&mut self, options: &ResultOptions) -> NextcodeResult<ResultSet> {
        let mut ret = ResultSet::default();
        for (i, page) in self.fetch_pages(options, ACCEPT_COMPACT_JSON).await?.into_iter().enumerate() {
            let contents: ResultSet = page.json().await?;
            if i == 0 {
                ret.header = contents.header;
            }
            ret.data.extend(contents.data);
        }
        Ok(ret)
    }

    /// Results of a completed query as tab-separated text
    pub async fn get_results_tsv(&mut self, options: &ResultOptions) -> NextcodeResult<String> {
        let mut ret = String::new();
        for page in self.fetch_pages(options, ACCEPT_TSV).await? {
            ret.push_str(&page.text().await?);
        }
        Ok(ret)
    }

    /// Stream the full results into a local file
    pub async fn download_results(&self, filename: impl AsRef<Path>) -> NextcodeResult<PathBuf> {
        let path = filename.as_ref().to_path_buf();
        let url = self
            .info
            .links
            .streamresults
            .clone()
            .ok_or_else(|| NextcodeError::query("Server does not support result downloading via streaming"))?;

        let started = Instant::now();
        let req = self.session.request(Method::GET, &url)?.header(ACCEPT, ACCEPT_TSV);
        let response = self.session.send(req).await?;
        let expected: Option<u64> = response
            .headers()
            .get("Line-Count")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        info!("Starting to stream {:?} lines...", expected);

        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        let mut num_bytes = 0usize;
        let mut lines = 0u64;
        let mut chunks = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            num_bytes += chunk.len();
            lines += chunk.iter().filter(|b| **b == b'\n').count() as u64;
            file.write_all(&chunk).await?;
            chunks += 1;
            if chunks % 1000 == 0 {
                info!(
                    "Downloaded {}/{:?} lines ({}) in {:.2} sec",
                    lines,
                    expected,
                    crate::utils::format_size(num_bytes as u64),
                    started.elapsed().as_secs_f64()
                );
            }
        }
        file.flush().await?;

        if let Some(expected) = expected {
            if lines < expected {
                return Err(NextcodeError::Query {
                    message: format!("Downloaded {} lines but {} lines expected", lines, expected),
                    query_id: Some(self.query_id()),
                });
            }
        }
        info!("Downloaded {} lines into {}", lines, path.display());
        Ok(path)
    }

    /// Cancel a running query
    pub async fn cancel(&self) -> NextcodeResult<()> {
        if !self.status().is_running() {
            return Err(NextcodeError::Query {
                message: "Query is not running".to_string(),
                query_id: Some(self.query_id()),
            });
        }
        let req = self.session.request(Method::DELETE, &self.info.links.self_link)?;
        self.session.send(req).await?;
        Ok(())
    }

    /// Links returned by the server for this query
    pub fn links(&self) -> &QueryLinks {
        &self.info.links
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<GorQuery {} ({})>", self.query_id(), self.status())
    }
}
