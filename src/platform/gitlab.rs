//! GitLab adapter: REST v4 enumeration plus the web-session dotenv path.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::net::HttpClient;

use super::{AdapterResult, Fetched, JobMeta, Platform, PlatformAdapter, Project, ScopeOptions};

const PER_PAGE: usize = 100;

pub struct GitlabAdapter {
    http: HttpClient,
    base: Url,
}

#[derive(Debug, Deserialize)]
struct GlProject {
    id: u64,
    path_with_namespace: String,
}

#[derive(Debug, Deserialize)]
struct GlJob {
    id: u64,
    name: String,
    pipeline: Option<GlPipeline>,
}

#[derive(Debug, Deserialize)]
struct GlPipeline {
    id: u64,
}

impl GitlabAdapter {
    pub fn new(http: HttpClient, base: Url) -> Self {
        Self { http, base }
    }

    fn base_str(&self) -> String {
        self.base.as_str().trim_end_matches('/').to_owned()
    }

    fn api(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("api/v4/{path}"));
        url
    }

    fn project_page_url(&self, opts: &ScopeOptions, page: u32) -> Url {
        let mut url = match &opts.namespace {
            Some(ns) => self.api(&format!("groups/{}/projects", encode(ns))),
            None => self.api("projects"),
        };
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("per_page", &PER_PAGE.to_string())
                .append_pair("page", &page.to_string())
                .append_pair("order_by", "last_activity_at")
                .append_pair("simple", "true");
            if opts.owned {
                query.append_pair("owned", "true");
            }
            if opts.member {
                query.append_pair("membership", "true");
            }
            if opts.public {
                query.append_pair("visibility", "public");
            }
            if let Some(search) = &opts.search {
                query.append_pair("search", search);
            }
            if let Some(after) = &opts.after {
                query.append_pair("last_activity_after", &after.to_rfc3339());
            }
        }
        url
    }

    fn job_page_url(&self, project_id: &str, page: u32) -> Url {
        let mut url = self.api(&format!("projects/{project_id}/jobs"));
        url.query_pairs_mut()
            .append_pair("per_page", &PER_PAGE.to_string())
            .append_pair("page", &page.to_string());
        url
    }

    fn meta_from(&self, project: &Project, job: GlJob) -> JobMeta {
        JobMeta {
            platform: Platform::Gitlab,
            base_url: self.base_str(),
            project_id: project.id.clone(),
            project_path: project.path.clone(),
            job_id: job.id.to_string(),
            job_name: job.name,
            pipeline_id: job.pipeline.map(|p| p.id.to_string()),
        }
    }
}

fn encode(raw: &str) -> String {
    // Project and group paths go into one URL segment: escape the slashes.
    raw.replace('/', "%2F")
}

#[async_trait]
impl PlatformAdapter for GitlabAdapter {
    fn platform(&self) -> Platform {
        Platform::Gitlab
    }

    async fn check_auth(&self) -> AdapterResult<()> {
        self.http.get_json::<serde_json::Value>(self.api("user")).await?;
        Ok(())
    }

    fn projects<'a>(&'a self, opts: &ScopeOptions) -> BoxStream<'a, AdapterResult<Project>> {
        let opts = opts.clone();

        if let Some(repo) = opts.repo.clone() {
            return stream::once(async move {
                let url = self.api(&format!("projects/{}", encode(&repo)));
                let (project, _) = self.http.get_json::<GlProject>(url).await?;
                Ok(Project { id: project.id.to_string(), path: project.path_with_namespace })
            })
            .boxed();
        }

        struct PageState {
            page: u32,
            buffer: VecDeque<Project>,
            done: bool,
        }

        stream::try_unfold(
            PageState { page: 1, buffer: VecDeque::new(), done: false },
            move |mut state| {
                let opts = opts.clone();
                async move {
                    loop {
                        if let Some(project) = state.buffer.pop_front() {
                            return Ok(Some((project, state)));
                        }
                        if state.done {
                            return Ok(None);
                        }
                        let url = self.project_page_url(&opts, state.page);
                        let batch = match self.http.get_json::<Vec<GlProject>>(url).await {
                            Ok((batch, _)) => batch,
                            Err(e) if e.is_forbidden() => {
                                warn!(error = %e, "access denied while listing projects; ending scope");
                                return Ok(None);
                            }
                            Err(e) => return Err(e),
                        };
                        if batch.len() < PER_PAGE {
                            state.done = true;
                        }
                        state.page += 1;
                        state.buffer.extend(batch.into_iter().map(|p| Project {
                            id: p.id.to_string(),
                            path: p.path_with_namespace,
                        }));
                        if state.buffer.is_empty() && state.done {
                            return Ok(None);
                        }
                    }
                }
            },
        )
        .boxed()
    }

    fn jobs<'a>(&'a self, project: &Project) -> BoxStream<'a, AdapterResult<JobMeta>> {
        let project = project.clone();

        struct PageState {
            page: u32,
            buffer: VecDeque<GlJob>,
            done: bool,
        }

        stream::try_unfold(
            PageState { page: 1, buffer: VecDeque::new(), done: false },
            move |mut state| {
                let project = project.clone();
                async move {
                    loop {
                        if let Some(job) = state.buffer.pop_front() {
                            return Ok(Some((self.meta_from(&project, job), state)));
                        }
                        if state.done {
                            return Ok(None);
                        }
                        let url = self.job_page_url(&project.id, state.page);
                        let batch = match self.http.get_json::<Vec<GlJob>>(url).await {
                            Ok((batch, _)) => batch,
                            Err(e) if e.is_forbidden() => {
                                warn!(project = project.path, "access denied while listing jobs; ending scope");
                                return Ok(None);
                            }
                            Err(e) if e.is_not_found() => {
                                debug!(project = project.path, "project has no CI jobs");
                                return Ok(None);
                            }
                            Err(e) => return Err(e),
                        };
                        if batch.len() < PER_PAGE {
                            state.done = true;
                        }
                        state.page += 1;
                        state.buffer.extend(batch);
                        if state.buffer.is_empty() && state.done {
                            return Ok(None);
                        }
                    }
                }
            },
        )
        .boxed()
    }

    async fn fetch_job_trace(&self, meta: &JobMeta) -> AdapterResult<Fetched> {
        let url = self.api(&format!("projects/{}/jobs/{}/trace", meta.project_id, meta.job_id));
        match self.http.get_bytes(url).await {
            Ok(bytes) => Ok(Fetched::Bytes(bytes)),
            Err(e) if e.is_not_found() => Ok(Fetched::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn fetch_job_artifact(&self, meta: &JobMeta) -> AdapterResult<Fetched> {
        let url = self.api(&format!("projects/{}/jobs/{}/artifacts", meta.project_id, meta.job_id));
        match self.http.get_bytes(url).await {
            Ok(bytes) => Ok(Fetched::Bytes(bytes)),
            Err(e) if e.is_not_found() => Ok(Fetched::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Dotenv dumps are only reachable through the web UI, not the REST API;
    /// the session cookie in the jar authenticates the request. Best-effort:
    /// anything but a byte payload is treated as absent.
    async fn fetch_dotenv(&self, meta: &JobMeta) -> AdapterResult<Fetched> {
        let mut url = self.base.clone();
        url.set_path(&format!(
            "{}/-/jobs/{}/artifacts/download",
            meta.project_path, meta.job_id
        ));
        url.set_query(Some("file_type=dotenv"));
        match self.http.get_bytes(url).await {
            // A signed-out session is redirected to the login page.
            Ok(bytes) if looks_like_html(&bytes) => {
                debug!(job = meta.job_id, "dotenv download returned HTML; session cookie rejected");
                Ok(Fetched::NotFound)
            }
            Ok(bytes) => Ok(Fetched::Bytes(bytes)),
            Err(e) if e.is_not_found() || e.is_forbidden() => Ok(Fetched::NotFound),
            Err(e) => Err(e),
        }
    }

    fn job_url(&self, meta: &JobMeta) -> String {
        format!("{}/{}/-/jobs/{}", meta.base_url, meta.project_path, meta.job_id)
    }
}

fn looks_like_html(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(64)];
    let head = String::from_utf8_lossy(head);
    let head = head.trim_start();
    head.starts_with("<!DOCTYPE") || head.starts_with("<html")
}
