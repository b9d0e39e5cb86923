//! Azure DevOps adapter: builds as jobs, continuation-token pagination,
//! zipped build logs.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use http::HeaderMap;
use reqwest::Url;
use serde::Deserialize;
use tracing::warn;

use crate::net::HttpClient;

use super::{
    pack_downloads, AdapterResult, Fetched, JobMeta, Platform, PlatformAdapter, Project,
    ScopeOptions,
};

const API_VERSION: &str = "7.1";
const PAGE_SIZE: usize = 100;
const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

pub struct AzureAdapter {
    http: HttpClient,
    base: Url,
    /// The DevOps organization; enumeration is always org-scoped.
    organization: String,
}

#[derive(Debug, Deserialize)]
struct AzList<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct AzProject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AzBuild {
    id: u64,
    #[serde(default)]
    definition: Option<AzDefinition>,
}

#[derive(Debug, Deserialize)]
struct AzDefinition {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AzArtifact {
    name: String,
    resource: AzResource,
}

#[derive(Debug, Deserialize)]
struct AzResource {
    #[serde(rename = "downloadUrl")]
    download_url: String,
}

impl AzureAdapter {
    pub fn new(http: HttpClient, base: Url, organization: String) -> Self {
        Self { http, base, organization }
    }

    fn base_str(&self) -> String {
        self.base.as_str().trim_end_matches('/').to_owned()
    }

    fn api(&self, segments: &str, continuation: Option<&str>) -> Url {
        let mut url = self.base.clone();
        url.set_path(segments);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("api-version", API_VERSION)
                .append_pair("$top", &PAGE_SIZE.to_string());
            if let Some(token) = continuation {
                query.append_pair("continuationToken", token);
            }
        }
        url
    }

    /// Split `org/project` back out of a stored project path.
    fn project_segment(meta: &JobMeta) -> &str {
        meta.project_path.split_once('/').map(|(_, p)| p).unwrap_or(&meta.project_path)
    }
}

fn continuation(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTINUATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[async_trait]
impl PlatformAdapter for AzureAdapter {
    fn platform(&self) -> Platform {
        Platform::Azure
    }

    async fn check_auth(&self) -> AdapterResult<()> {
        let url = self.api(&format!("{}/_apis/projects", self.organization), None);
        self.http.get_json::<serde_json::Value>(url).await?;
        Ok(())
    }

    fn projects<'a>(&'a self, opts: &ScopeOptions) -> BoxStream<'a, AdapterResult<Project>> {
        let opts = opts.clone();
        if opts.owned || opts.member || opts.public {
            warn!("azure devops does not support ownership scope filters; ignoring");
        }
        if opts.search.is_some() || opts.after.is_some() {
            warn!("azure devops does not support --search/--after; ignoring");
        }

        let organization = self.organization.clone();
        if let Some(project) = opts.repo.clone() {
            return stream::once(async move {
                let url = self.api(&format!("{organization}/_apis/projects/{project}"), None);
                let (project, _) = self.http.get_json::<AzProject>(url).await?;
                Ok(Project {
                    id: project.name.clone(),
                    path: format!("{organization}/{}", project.name),
                })
            })
            .boxed();
        }

        struct PageState {
            continuation: Option<String>,
            buffer: VecDeque<Project>,
            first: bool,
        }

        stream::try_unfold(
            PageState { continuation: None, buffer: VecDeque::new(), first: true },
            move |mut state| {
                let organization = organization.clone();
                async move {
                    loop {
                        if let Some(project) = state.buffer.pop_front() {
                            return Ok(Some((project, state)));
                        }
                        if !state.first && state.continuation.is_none() {
                            return Ok(None);
                        }
                        state.first = false;
                        let url = self.api(
                            &format!("{organization}/_apis/projects"),
                            state.continuation.as_deref(),
                        );
                        let (list, headers) =
                            match self.http.get_json::<AzList<AzProject>>(url).await {
                                Ok(ok) => ok,
                                Err(e) if e.is_forbidden() => {
                                    warn!(error = %e, "access denied while listing projects; ending scope");
                                    return Ok(None);
                                }
                                Err(e) => return Err(e),
                            };
                        state.continuation = continuation(&headers);
                        state.buffer.extend(list.value.into_iter().map(|p| Project {
                            id: p.name.clone(),
                            path: format!("{organization}/{}", p.name),
                        }));
                        if state.buffer.is_empty() && state.continuation.is_none() {
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
            continuation: Option<String>,
            buffer: VecDeque<AzBuild>,
            first: bool,
        }

        stream::try_unfold(
            PageState { continuation: None, buffer: VecDeque::new(), first: true },
            move |mut state| {
                let project = project.clone();
                async move {
                    loop {
                        if let Some(build) = state.buffer.pop_front() {
                            let meta = JobMeta {
                                platform: Platform::Azure,
                                base_url: self.base_str(),
                                project_id: project.id.clone(),
                                project_path: project.path.clone(),
                                job_id: build.id.to_string(),
                                job_name: build
                                    .definition
                                    .map(|d| d.name)
                                    .unwrap_or_else(|| "build".to_owned()),
                                pipeline_id: None,
                            };
                            return Ok(Some((meta, state)));
                        }
                        if !state.first && state.continuation.is_none() {
                            return Ok(None);
                        }
                        state.first = false;
                        let url = self.api(
                            &format!("{}/_apis/build/builds", project.path),
                            state.continuation.as_deref(),
                        );
                        let (list, headers) = match self.http.get_json::<AzList<AzBuild>>(url).await
                        {
                            Ok(ok) => ok,
                            Err(e) if e.is_forbidden() => {
                                warn!(project = project.path, "access denied while listing builds; ending scope");
                                return Ok(None);
                            }
                            Err(e) if e.is_not_found() => return Ok(None),
                            Err(e) => return Err(e),
                        };
                        state.continuation = continuation(&headers);
                        state.buffer.extend(list.value);
                        if state.buffer.is_empty() && state.continuation.is_none() {
                            return Ok(None);
                        }
                    }
                }
            },
        )
        .boxed()
    }

    /// The whole build log set comes back as one zip; the archive walker
    /// unwraps it downstream.
    async fn fetch_job_trace(&self, meta: &JobMeta) -> AdapterResult<Fetched> {
        let mut url = self.base.clone();
        url.set_path(&format!(
            "{}/{}/_apis/build/builds/{}/logs",
            self.organization,
            Self::project_segment(meta),
            meta.job_id
        ));
        url.set_query(Some(&format!("api-version={API_VERSION}&$format=zip")));
        match self.http.get_bytes(url).await {
            Ok(bytes) => Ok(Fetched::Bytes(bytes)),
            Err(e) if e.is_not_found() => Ok(Fetched::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn fetch_job_artifact(&self, meta: &JobMeta) -> AdapterResult<Fetched> {
        let mut url = self.base.clone();
        url.set_path(&format!(
            "{}/{}/_apis/build/builds/{}/artifacts",
            self.organization,
            Self::project_segment(meta),
            meta.job_id
        ));
        url.set_query(Some(&format!("api-version={API_VERSION}")));
        let (list, _) = match self.http.get_json::<AzList<AzArtifact>>(url).await {
            Ok(ok) => ok,
            Err(e) if e.is_not_found() => return Ok(Fetched::NotFound),
            Err(e) => return Err(e),
        };

        let mut downloads = Vec::new();
        for artifact in list.value {
            let Ok(url) = Url::parse(&artifact.resource.download_url) else {
                continue;
            };
            match self.http.get_bytes(url).await {
                Ok(bytes) => downloads.push((format!("{}.zip", artifact.name), bytes)),
                Err(e) if e.is_not_found() => continue,
                Err(e) if e.is_too_large() => {
                    warn!(artifact = artifact.name, "artifact exceeds the size cap; skipping");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        if downloads.is_empty() {
            return Ok(Fetched::NotFound);
        }
        match pack_downloads(downloads) {
            Ok(bundle) => Ok(Fetched::Bytes(bundle)),
            Err(e) => {
                warn!(error = %e, "failed to bundle build artifacts; skipping");
                Ok(Fetched::NotFound)
            }
        }
    }

    async fn fetch_dotenv(&self, _meta: &JobMeta) -> AdapterResult<Fetched> {
        Ok(Fetched::NotFound)
    }

    fn job_url(&self, meta: &JobMeta) -> String {
        format!("{}/{}/_build/results?buildId={}", meta.base_url, meta.project_path, meta.job_id)
    }
}
