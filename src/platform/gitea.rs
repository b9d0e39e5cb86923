//! Gitea adapter: Actions tasks double as jobs; artifacts are repo-scoped
//! and filtered down to the task's run.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::net::HttpClient;

use super::{
    pack_downloads, AdapterResult, Fetched, JobMeta, Platform, PlatformAdapter, Project,
    ScopeOptions,
};

/// Gitea caps list endpoints at 50 items per page.
const PER_PAGE: usize = 50;

pub struct GiteaAdapter {
    http: HttpClient,
    base: Url,
}

#[derive(Debug, Deserialize)]
struct GtRepo {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct GtSearchPage {
    data: Vec<GtRepo>,
}

#[derive(Debug, Deserialize)]
struct GtTaskPage {
    workflow_runs: Vec<GtTask>,
}

#[derive(Debug, Deserialize)]
struct GtTask {
    id: u64,
    name: String,
    #[serde(default)]
    run_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GtArtifactPage {
    artifacts: Vec<GtArtifact>,
}

#[derive(Debug, Deserialize)]
struct GtArtifact {
    name: String,
    archive_download_url: String,
    #[serde(default)]
    workflow_run: Option<GtRunRef>,
}

#[derive(Debug, Deserialize)]
struct GtRunRef {
    id: u64,
}

impl GiteaAdapter {
    pub fn new(http: HttpClient, base: Url) -> Self {
        Self { http, base }
    }

    fn base_str(&self) -> String {
        self.base.as_str().trim_end_matches('/').to_owned()
    }

    fn api(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("api/v1/{path}"));
        url
    }

    fn paged(&self, path: &str, page: u32) -> Url {
        let mut url = self.api(path);
        url.query_pairs_mut()
            .append_pair("limit", &PER_PAGE.to_string())
            .append_pair("page", &page.to_string());
        url
    }
}

#[async_trait]
impl PlatformAdapter for GiteaAdapter {
    fn platform(&self) -> Platform {
        Platform::Gitea
    }

    async fn check_auth(&self) -> AdapterResult<()> {
        self.http.get_json::<serde_json::Value>(self.api("user")).await?;
        Ok(())
    }

    fn projects<'a>(&'a self, opts: &ScopeOptions) -> BoxStream<'a, AdapterResult<Project>> {
        let opts = opts.clone();
        if opts.member {
            warn!("gitea does not distinguish --member from --owned; using the authenticated listing");
        }
        if opts.after.is_some() {
            warn!("gitea does not support --after; ignoring");
        }

        if let Some(repo) = opts.repo.clone() {
            return stream::once(async move {
                let (repo, _) =
                    self.http.get_json::<GtRepo>(self.api(&format!("repos/{repo}"))).await?;
                Ok(Project { id: repo.full_name.clone(), path: repo.full_name })
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
                        let outcome = if let Some(org) = &opts.namespace {
                            let url = self.paged(&format!("orgs/{org}/repos"), state.page);
                            self.http.get_json::<Vec<GtRepo>>(url).await
                        } else if opts.search.is_some() || opts.public {
                            let mut url = self.paged("repos/search", state.page);
                            if let Some(search) = &opts.search {
                                url.query_pairs_mut().append_pair("q", search);
                            }
                            if opts.public {
                                url.query_pairs_mut().append_pair("private", "false");
                            }
                            self.http
                                .get_json::<GtSearchPage>(url)
                                .await
                                .map(|(page, headers)| (page.data, headers))
                        } else {
                            let url = self.paged("user/repos", state.page);
                            self.http.get_json::<Vec<GtRepo>>(url).await
                        };
                        let (batch, _) = match outcome {
                            Ok(ok) => ok,
                            Err(e) if e.is_forbidden() => {
                                warn!(error = %e, "access denied while listing repositories; ending scope");
                                return Ok(None);
                            }
                            Err(e) => return Err(e),
                        };
                        if batch.len() < PER_PAGE {
                            state.done = true;
                        }
                        state.page += 1;
                        state.buffer.extend(batch.into_iter().map(|r| Project {
                            id: r.full_name.clone(),
                            path: r.full_name,
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
            buffer: VecDeque<GtTask>,
            done: bool,
        }

        stream::try_unfold(
            PageState { page: 1, buffer: VecDeque::new(), done: false },
            move |mut state| {
                let project = project.clone();
                async move {
                    loop {
                        if let Some(task) = state.buffer.pop_front() {
                            let meta = JobMeta {
                                platform: Platform::Gitea,
                                base_url: self.base_str(),
                                project_id: project.id.clone(),
                                project_path: project.path.clone(),
                                job_id: task.id.to_string(),
                                job_name: task.name,
                                pipeline_id: task.run_id.map(|id| id.to_string()),
                            };
                            return Ok(Some((meta, state)));
                        }
                        if state.done {
                            return Ok(None);
                        }
                        let url = self
                            .paged(&format!("repos/{}/actions/tasks", project.path), state.page);
                        let batch = match self.http.get_json::<GtTaskPage>(url).await {
                            Ok((page, _)) => page.workflow_runs,
                            Err(e) if e.is_forbidden() => {
                                warn!(project = project.path, "access denied while listing tasks; ending scope");
                                return Ok(None);
                            }
                            Err(e) if e.is_not_found() => {
                                debug!(project = project.path, "actions disabled; no tasks");
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
        let url =
            self.api(&format!("repos/{}/actions/tasks/{}/logs", meta.project_path, meta.job_id));
        match self.http.get_bytes(url).await {
            Ok(bytes) => Ok(Fetched::Bytes(bytes)),
            Err(e) if e.is_not_found() => Ok(Fetched::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn fetch_job_artifact(&self, meta: &JobMeta) -> AdapterResult<Fetched> {
        let url = self.api(&format!("repos/{}/actions/artifacts", meta.project_path));
        let (page, _) = match self.http.get_json::<GtArtifactPage>(url).await {
            Ok(ok) => ok,
            Err(e) if e.is_not_found() => return Ok(Fetched::NotFound),
            Err(e) => return Err(e),
        };

        let run_filter = meta.pipeline_id.as_deref();
        let mut downloads = Vec::new();
        for artifact in page.artifacts {
            let belongs = match (&artifact.workflow_run, run_filter) {
                (Some(run), Some(filter)) => run.id.to_string() == filter,
                // Without run attribution we cannot tie the artifact to this
                // job; skip rather than re-scan it for every task.
                (None, Some(_)) => false,
                (_, None) => true,
            };
            if !belongs {
                continue;
            }
            let Ok(url) = Url::parse(&artifact.archive_download_url) else {
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
                warn!(error = %e, "failed to bundle artifacts; skipping");
                Ok(Fetched::NotFound)
            }
        }
    }

    async fn fetch_dotenv(&self, _meta: &JobMeta) -> AdapterResult<Fetched> {
        Ok(Fetched::NotFound)
    }

    fn job_url(&self, meta: &JobMeta) -> String {
        let run = meta.pipeline_id.as_deref().unwrap_or("0");
        format!(
            "{}/{}/actions/runs/{run}/jobs/{}",
            meta.base_url, meta.project_path, meta.job_id
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn adapter_for(uri: &str) -> GiteaAdapter {
        let http = HttpClient::builder().build(CancellationToken::new()).unwrap();
        GiteaAdapter::new(http, Url::parse(uri).unwrap())
    }

    #[test]
    fn job_url_uses_run_and_task_ids() {
        let adapter = adapter_for("https://gitea.example.com");
        let meta = JobMeta {
            platform: Platform::Gitea,
            base_url: "https://gitea.example.com".into(),
            project_id: "dev/tool".into(),
            project_path: "dev/tool".into(),
            job_id: "12".into(),
            job_name: "build".into(),
            pipeline_id: Some("7".into()),
        };
        assert_eq!(
            adapter.job_url(&meta),
            "https://gitea.example.com/dev/tool/actions/runs/7/jobs/12"
        );
    }

    #[tokio::test]
    async fn tasks_page_maps_to_job_meta() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repos/dev/tool/actions/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "workflow_runs": [{"id": 12, "name": "build", "run_id": 7}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server.uri());
        let project = Project { id: "dev/tool".into(), path: "dev/tool".into() };
        let jobs: Vec<JobMeta> = adapter
            .jobs(&project)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "12");
        assert_eq!(jobs[0].pipeline_id.as_deref(), Some("7"));
    }
}
