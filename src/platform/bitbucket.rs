//! Bitbucket Cloud adapter: 2.0 REST API, cursor-style `next` links,
//! pipeline steps as jobs.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::net::HttpClient;

use super::{AdapterResult, Fetched, JobMeta, Platform, PlatformAdapter, Project, ScopeOptions};

const PER_PAGE: usize = 100;

pub struct BitbucketAdapter {
    http: HttpClient,
    /// API root, normally `https://api.bitbucket.org/2.0`.
    api_base: Url,
    /// Web root used for permalinks, normally `https://bitbucket.org`.
    web_base: Url,
}

#[derive(Debug, Deserialize)]
struct BbPage<T> {
    values: Vec<T>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BbRepo {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct BbPipeline {
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct BbStep {
    uuid: String,
    #[serde(default)]
    name: Option<String>,
}

impl BitbucketAdapter {
    pub fn new(http: HttpClient, api_base: Url, web_base: Url) -> Self {
        Self { http, api_base, web_base }
    }

    fn api(&self, path: &str) -> Url {
        let mut url = self.api_base.clone();
        let prefix = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{prefix}/{path}"));
        url
    }

    fn first_page(&self, path: &str, extra: &[(&str, &str)]) -> Url {
        let mut url = self.api(path);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("pagelen", &PER_PAGE.to_string());
            for (k, v) in extra {
                query.append_pair(k, v);
            }
        }
        url
    }

    /// Follow one `next` cursor; ends the stream on a bad link rather than
    /// looping forever.
    async fn page<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> AdapterResult<(Vec<T>, Option<Url>)> {
        let (page, _) = self.http.get_json::<BbPage<T>>(url).await?;
        let next = page.next.as_deref().and_then(|n| Url::parse(n).ok());
        Ok((page.values, next))
    }
}

#[async_trait]
impl PlatformAdapter for BitbucketAdapter {
    fn platform(&self) -> Platform {
        Platform::Bitbucket
    }

    async fn check_auth(&self) -> AdapterResult<()> {
        self.http.get_json::<serde_json::Value>(self.api("user")).await?;
        Ok(())
    }

    fn projects<'a>(&'a self, opts: &ScopeOptions) -> BoxStream<'a, AdapterResult<Project>> {
        let opts = opts.clone();
        if opts.search.is_some() {
            warn!("bitbucket does not support --search; ignoring");
        }
        if opts.public {
            warn!("bitbucket does not support --public enumeration; ignoring");
        }
        if opts.after.is_some() {
            warn!("bitbucket does not support --after; ignoring");
        }

        if let Some(repo) = opts.repo.clone() {
            return stream::once(async move {
                let (repo, _) = self
                    .http
                    .get_json::<BbRepo>(self.api(&format!("repositories/{repo}")))
                    .await?;
                Ok(Project { id: repo.full_name.clone(), path: repo.full_name })
            })
            .boxed();
        }

        let first = match &opts.namespace {
            Some(workspace) => self.first_page(&format!("repositories/{workspace}"), &[]),
            None => {
                let role = if opts.owned { "owner" } else { "member" };
                self.first_page("repositories", &[("role", role)])
            }
        };

        struct PageState {
            next: Option<Url>,
            buffer: VecDeque<Project>,
        }

        stream::try_unfold(
            PageState { next: Some(first), buffer: VecDeque::new() },
            move |mut state| async move {
                loop {
                    if let Some(project) = state.buffer.pop_front() {
                        return Ok(Some((project, state)));
                    }
                    let Some(url) = state.next.take() else {
                        return Ok(None);
                    };
                    let (batch, next) = match self.page::<BbRepo>(url).await {
                        Ok(ok) => ok,
                        Err(e) if e.is_forbidden() => {
                            warn!(error = %e, "access denied while listing repositories; ending scope");
                            return Ok(None);
                        }
                        Err(e) => return Err(e),
                    };
                    state.next = next;
                    state.buffer.extend(batch.into_iter().map(|r| Project {
                        id: r.full_name.clone(),
                        path: r.full_name,
                    }));
                    if state.buffer.is_empty() && state.next.is_none() {
                        return Ok(None);
                    }
                }
            },
        )
        .boxed()
    }

    fn jobs<'a>(&'a self, project: &Project) -> BoxStream<'a, AdapterResult<JobMeta>> {
        let project = project.clone();
        let first = self.first_page(
            &format!("repositories/{}/pipelines/", project.path),
            &[("sort", "-created_on")],
        );

        struct PageState {
            next: Option<Url>,
            pipelines: VecDeque<String>,
            steps: VecDeque<(String, BbStep)>,
        }

        stream::try_unfold(
            PageState { next: Some(first), pipelines: VecDeque::new(), steps: VecDeque::new() },
            move |mut state| {
                let project = project.clone();
                async move {
                    loop {
                        if let Some((pipeline, step)) = state.steps.pop_front() {
                            let meta = JobMeta {
                                platform: Platform::Bitbucket,
                                base_url: self
                                    .web_base
                                    .as_str()
                                    .trim_end_matches('/')
                                    .to_owned(),
                                project_id: project.id.clone(),
                                project_path: project.path.clone(),
                                job_id: step.uuid,
                                job_name: step.name.unwrap_or_else(|| "step".to_owned()),
                                pipeline_id: Some(pipeline),
                            };
                            return Ok(Some((meta, state)));
                        }
                        if let Some(pipeline) = state.pipelines.pop_front() {
                            let url = self.first_page(
                                &format!(
                                    "repositories/{}/pipelines/{pipeline}/steps/",
                                    project.path
                                ),
                                &[],
                            );
                            match self.page::<BbStep>(url).await {
                                Ok((steps, _)) => {
                                    state
                                        .steps
                                        .extend(steps.into_iter().map(|s| (pipeline.clone(), s)));
                                }
                                Err(e) if e.is_not_found() || e.is_forbidden() => {
                                    debug!(pipeline, "pipeline steps unavailable; skipping");
                                }
                                Err(e) => return Err(e),
                            }
                            continue;
                        }
                        let Some(url) = state.next.take() else {
                            return Ok(None);
                        };
                        let (batch, next) = match self.page::<BbPipeline>(url).await {
                            Ok(ok) => ok,
                            Err(e) if e.is_forbidden() => {
                                warn!(project = project.path, "access denied while listing pipelines; ending scope");
                                return Ok(None);
                            }
                            Err(e) if e.is_not_found() => return Ok(None),
                            Err(e) => return Err(e),
                        };
                        state.next = next;
                        state.pipelines.extend(batch.into_iter().map(|p| p.uuid));
                        if state.pipelines.is_empty()
                            && state.steps.is_empty()
                            && state.next.is_none()
                        {
                            return Ok(None);
                        }
                    }
                }
            },
        )
        .boxed()
    }

    async fn fetch_job_trace(&self, meta: &JobMeta) -> AdapterResult<Fetched> {
        let Some(pipeline) = &meta.pipeline_id else {
            return Ok(Fetched::NotFound);
        };
        let url = self.api(&format!(
            "repositories/{}/pipelines/{pipeline}/steps/{}/log",
            meta.project_path, meta.job_id
        ));
        match self.http.get_bytes(url).await {
            Ok(bytes) => Ok(Fetched::Bytes(bytes)),
            Err(e) if e.is_not_found() => Ok(Fetched::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Bitbucket Cloud exposes no per-step artifact download API.
    async fn fetch_job_artifact(&self, _meta: &JobMeta) -> AdapterResult<Fetched> {
        Ok(Fetched::NotFound)
    }

    async fn fetch_dotenv(&self, _meta: &JobMeta) -> AdapterResult<Fetched> {
        Ok(Fetched::NotFound)
    }

    fn job_url(&self, meta: &JobMeta) -> String {
        let pipeline = meta.pipeline_id.as_deref().unwrap_or("-");
        format!(
            "{}/{}/pipelines/results/{pipeline}/steps/{}",
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

    fn adapter_for(uri: &str) -> BitbucketAdapter {
        let http = HttpClient::builder().build(CancellationToken::new()).unwrap();
        BitbucketAdapter::new(
            http,
            Url::parse(uri).unwrap(),
            Url::parse("https://bitbucket.org").unwrap(),
        )
    }

    #[test]
    fn job_url_is_deterministic() {
        let adapter = adapter_for("https://api.bitbucket.org/2.0");
        let meta = JobMeta {
            platform: Platform::Bitbucket,
            base_url: "https://bitbucket.org".into(),
            project_id: "team/app".into(),
            project_path: "team/app".into(),
            job_id: "{step-uuid}".into(),
            job_name: "build".into(),
            pipeline_id: Some("{pipe-uuid}".into()),
        };
        assert_eq!(
            adapter.job_url(&meta),
            "https://bitbucket.org/team/app/pipelines/results/{pipe-uuid}/steps/{step-uuid}"
        );
    }

    #[tokio::test]
    async fn pipelines_expand_into_steps() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repositories/team/app/pipelines/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [{"uuid": "p1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repositories/team/app/pipelines/p1/steps/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "values": [{"uuid": "s1", "name": "build"}, {"uuid": "s2", "name": "deploy"}]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server.uri());
        let project = Project { id: "team/app".into(), path: "team/app".into() };
        let jobs: Vec<JobMeta> = adapter
            .jobs(&project)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "s1");
        assert_eq!(jobs[1].job_name, "deploy");
        assert_eq!(jobs[0].pipeline_id.as_deref(), Some("p1"));
    }
}
