//! GitHub adapter: Actions workflow runs and their jobs, Link-header
//! pagination, run-level artifact bundles.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use http::header::{HeaderMap, LINK};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::net::HttpClient;

use super::{
    pack_downloads, AdapterResult, Fetched, JobMeta, Platform, PlatformAdapter, Project,
    ScopeOptions,
};

const PER_PAGE: usize = 100;

pub struct GithubAdapter {
    http: HttpClient,
    /// API root, e.g. `https://api.github.com` or `https://ghe.corp/api/v3`.
    api_base: Url,
    /// Web root used for permalinks, e.g. `https://github.com`.
    web_base: Url,
}

#[derive(Debug, Deserialize)]
struct GhRepo {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct GhSearchPage {
    items: Vec<GhRepo>,
}

#[derive(Debug, Deserialize)]
struct GhRunPage {
    workflow_runs: Vec<GhRun>,
}

#[derive(Debug, Deserialize)]
struct GhRun {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct GhJobPage {
    jobs: Vec<GhJob>,
}

#[derive(Debug, Deserialize)]
struct GhJob {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhArtifactPage {
    artifacts: Vec<GhArtifact>,
}

#[derive(Debug, Deserialize)]
struct GhArtifact {
    name: String,
    archive_download_url: String,
    expired: bool,
}

impl GithubAdapter {
    pub fn new(http: HttpClient, api_base: Url, web_base: Url) -> Self {
        Self { http, api_base, web_base }
    }

    fn api(&self, path: &str) -> Url {
        let mut url = self.api_base.clone();
        let prefix = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{prefix}/{path}"));
        url
    }

    fn paged(&self, path: &str, page: u32) -> Url {
        let mut url = self.api(path);
        url.query_pairs_mut()
            .append_pair("per_page", &PER_PAGE.to_string())
            .append_pair("page", &page.to_string());
        url
    }

    fn meta_from(&self, project: &Project, run_id: u64, job: GhJob) -> JobMeta {
        JobMeta {
            platform: Platform::Github,
            base_url: self.web_base.as_str().trim_end_matches('/').to_owned(),
            project_id: project.id.clone(),
            project_path: project.path.clone(),
            job_id: job.id.to_string(),
            job_name: job.name,
            pipeline_id: Some(run_id.to_string()),
        }
    }
}

/// GitHub signals the end of a listing by omitting `rel="next"` from the
/// `Link` response header.
fn has_next_page(headers: &HeaderMap) -> bool {
    headers
        .get(LINK)
        .and_then(|v| v.to_str().ok())
        .map(|link| link.contains("rel=\"next\""))
        .unwrap_or(false)
}

#[async_trait]
impl PlatformAdapter for GithubAdapter {
    fn platform(&self) -> Platform {
        Platform::Github
    }

    async fn check_auth(&self) -> AdapterResult<()> {
        self.http.get_json::<serde_json::Value>(self.api("user")).await?;
        Ok(())
    }

    fn projects<'a>(&'a self, opts: &ScopeOptions) -> BoxStream<'a, AdapterResult<Project>> {
        let opts = opts.clone();
        if opts.public {
            warn!("github does not support --public enumeration; ignoring");
        }
        if opts.after.is_some() {
            warn!("github does not support --after; ignoring");
        }

        if let Some(repo) = opts.repo.clone() {
            return stream::once(async move {
                let (repo, _) = self.http.get_json::<GhRepo>(self.api(&format!("repos/{repo}"))).await?;
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
                            self.http.get_json::<Vec<GhRepo>>(url).await
                        } else if let Some(search) = &opts.search {
                            let mut url = self.paged("search/repositories", state.page);
                            url.query_pairs_mut().append_pair("q", search);
                            self.http
                                .get_json::<GhSearchPage>(url)
                                .await
                                .map(|(page, headers)| (page.items, headers))
                        } else {
                            // Authenticated listing covers --owned/--member
                            // through the affiliation filter.
                            let mut url = self.paged("user/repos", state.page);
                            let affiliation = if opts.owned && !opts.member {
                                "owner"
                            } else if opts.member && !opts.owned {
                                "collaborator,organization_member"
                            } else {
                                "owner,collaborator,organization_member"
                            };
                            url.query_pairs_mut().append_pair("affiliation", affiliation);
                            self.http.get_json::<Vec<GhRepo>>(url).await
                        };
                        let (batch, headers) = match outcome {
                            Ok(ok) => ok,
                            Err(e) if e.is_forbidden() => {
                                warn!(error = %e, "access denied while listing repositories; ending scope");
                                return Ok(None);
                            }
                            Err(e) => return Err(e),
                        };
                        if !has_next_page(&headers) {
                            state.done = true;
                        }
                        state.page += 1;
                        state
                            .buffer
                            .extend(batch.into_iter().map(|r| Project {
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
            run_page: u32,
            runs: VecDeque<u64>,
            jobs: VecDeque<(u64, GhJob)>,
            runs_done: bool,
        }

        stream::try_unfold(
            PageState { run_page: 1, runs: VecDeque::new(), jobs: VecDeque::new(), runs_done: false },
            move |mut state| {
                let project = project.clone();
                async move {
                    loop {
                        if let Some((run_id, job)) = state.jobs.pop_front() {
                            return Ok(Some((self.meta_from(&project, run_id, job), state)));
                        }
                        if let Some(run_id) = state.runs.pop_front() {
                            let url = self.paged(
                                &format!("repos/{}/actions/runs/{run_id}/jobs", project.path),
                                1,
                            );
                            match self.http.get_json::<GhJobPage>(url).await {
                                Ok((page, _)) => {
                                    state.jobs.extend(page.jobs.into_iter().map(|j| (run_id, j)));
                                }
                                Err(e) if e.is_not_found() || e.is_forbidden() => {
                                    debug!(run = run_id, "run jobs unavailable; skipping run");
                                }
                                Err(e) => return Err(e),
                            }
                            continue;
                        }
                        if state.runs_done {
                            return Ok(None);
                        }
                        let url = self.paged(
                            &format!("repos/{}/actions/runs", project.path),
                            state.run_page,
                        );
                        let (page, headers) = match self.http.get_json::<GhRunPage>(url).await {
                            Ok(ok) => ok,
                            Err(e) if e.is_forbidden() => {
                                warn!(project = project.path, "access denied while listing runs; ending scope");
                                return Ok(None);
                            }
                            Err(e) if e.is_not_found() => return Ok(None),
                            Err(e) => return Err(e),
                        };
                        if !has_next_page(&headers) {
                            state.runs_done = true;
                        }
                        state.run_page += 1;
                        state.runs.extend(page.workflow_runs.into_iter().map(|r| r.id));
                        if state.runs.is_empty() && state.jobs.is_empty() && state.runs_done {
                            return Ok(None);
                        }
                    }
                }
            },
        )
        .boxed()
    }

    async fn fetch_job_trace(&self, meta: &JobMeta) -> AdapterResult<Fetched> {
        let url = self.api(&format!("repos/{}/actions/jobs/{}/logs", meta.project_path, meta.job_id));
        match self.http.get_bytes(url).await {
            Ok(bytes) => Ok(Fetched::Bytes(bytes)),
            Err(e) if e.is_not_found() => Ok(Fetched::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Artifacts hang off the workflow run, not the job. Every live artifact
    /// of the job's run is downloaded and bundled so the walker sees one
    /// container per job.
    async fn fetch_job_artifact(&self, meta: &JobMeta) -> AdapterResult<Fetched> {
        let Some(run_id) = &meta.pipeline_id else {
            return Ok(Fetched::NotFound);
        };
        let url = self.api(&format!(
            "repos/{}/actions/runs/{run_id}/artifacts",
            meta.project_path
        ));
        let (page, _) = match self.http.get_json::<GhArtifactPage>(url).await {
            Ok(ok) => ok,
            Err(e) if e.is_not_found() => return Ok(Fetched::NotFound),
            Err(e) => return Err(e),
        };

        let mut downloads = Vec::new();
        for artifact in page.artifacts.into_iter().filter(|a| !a.expired) {
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
                warn!(error = %e, "failed to bundle run artifacts; skipping");
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
            "{}/{}/actions/runs/{run}/job/{}",
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

    fn adapter_for(uri: &str) -> GithubAdapter {
        let http = HttpClient::builder().build(CancellationToken::new()).unwrap();
        GithubAdapter::new(http, Url::parse(uri).unwrap(), Url::parse("https://github.com").unwrap())
    }

    fn meta() -> JobMeta {
        JobMeta {
            platform: Platform::Github,
            base_url: "https://github.com".into(),
            project_id: "octo/app".into(),
            project_path: "octo/app".into(),
            job_id: "555".into(),
            job_name: "test".into(),
            pipeline_id: Some("99".into()),
        }
    }

    #[test]
    fn job_url_embeds_run_and_job() {
        let adapter = adapter_for("https://api.github.com");
        assert_eq!(
            adapter.job_url(&meta()),
            "https://github.com/octo/app/actions/runs/99/job/555"
        );
    }

    #[test]
    fn link_header_detection() {
        let mut headers = HeaderMap::new();
        assert!(!has_next_page(&headers));
        headers.insert(
            LINK,
            "<https://api.github.com/user/repos?page=2>; rel=\"next\", \
             <https://api.github.com/user/repos?page=5>; rel=\"last\""
                .parse()
                .unwrap(),
        );
        assert!(has_next_page(&headers));
        headers.insert(
            LINK,
            "<https://api.github.com/user/repos?page=1>; rel=\"prev\"".parse().unwrap(),
        );
        assert!(!has_next_page(&headers));
    }

    #[tokio::test]
    async fn jobs_walk_runs_then_jobs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/app/actions/runs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"workflow_runs": [{"id": 99}]}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/octo/app/actions/runs/99/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"jobs": [{"id": 555, "name": "test"}, {"id": 556, "name": "lint"}]}),
            ))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server.uri());
        let project = Project { id: "octo/app".into(), path: "octo/app".into() };
        let jobs: Vec<JobMeta> = adapter
            .jobs(&project)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "555");
        assert_eq!(jobs[0].pipeline_id.as_deref(), Some("99"));
        assert_eq!(jobs[1].job_name, "lint");
    }

    #[tokio::test]
    async fn run_artifacts_are_bundled() {
        let server = MockServer::start().await;
        let download = format!("{}/download/7", server.uri());
        Mock::given(method("GET"))
            .and(path("/repos/octo/app/actions/runs/99/artifacts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "artifacts": [
                    {"name": "logs", "archive_download_url": download, "expired": false},
                    {"name": "old", "archive_download_url": download, "expired": true}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/7"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"artifact-bytes".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter_for(&server.uri());
        let fetched = adapter.fetch_job_artifact(&meta()).await.unwrap();
        let bytes = fetched.into_bytes().expect("bundle produced");
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.by_index(0).unwrap().name(), "logs.zip");
    }
}
