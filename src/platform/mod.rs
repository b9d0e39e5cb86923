//! Platform adapters.
//!
//! Each supported CI/CD platform implements [`PlatformAdapter`]: paginated,
//! lazy enumeration of projects and jobs plus the fetches for a job's trace,
//! artifact archive, and (where the platform has one) dotenv dump. Pagination
//! cursors and wire encodings are internal to each adapter.

pub mod azure;
pub mod bitbucket;
pub mod gitea;
pub mod github;
pub mod gitlab;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::net::HttpError;

pub use azure::AzureAdapter;
pub use bitbucket::BitbucketAdapter;
pub use gitea::GiteaAdapter;
pub use github::GithubAdapter;
pub use gitlab::GitlabAdapter;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Platform {
    Gitlab,
    Github,
    Gitea,
    Bitbucket,
    Azure,
}

/// A project / repository / workspace-repo as the platform names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Identifier the platform API addresses the project by.
    pub id: String,
    /// Human path, e.g. `group/app` or `owner/repo`.
    pub path: String,
}

/// Stable identifiers for one executed job, sufficient to reconstruct the
/// permalink URL without touching the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub platform: Platform,
    /// Instance base URL, scheme + host (+ optional port), no trailing slash.
    pub base_url: String,
    pub project_id: String,
    pub project_path: String,
    pub job_id: String,
    pub job_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
}

/// Scope filters supplied on the command line. Adapters honor whichever
/// subset their platform supports and warn about the rest.
#[derive(Debug, Clone, Default)]
pub struct ScopeOptions {
    pub owned: bool,
    pub member: bool,
    pub public: bool,
    pub search: Option<String>,
    pub namespace: Option<String>,
    pub repo: Option<String>,
    /// Only consider projects with activity after this instant.
    pub after: Option<chrono::DateTime<chrono::Utc>>,
}

/// Result of fetching a single remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Bytes(Vec<u8>),
    NotFound,
}

impl Fetched {
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Fetched::Bytes(b) => Some(b),
            Fetched::NotFound => None,
        }
    }
}

pub type AdapterResult<T> = Result<T, HttpError>;

/// The platform-agnostic surface the scheduler drives.
///
/// `projects` and `jobs` are lazy, finite, non-restartable streams; dropping
/// them abandons the underlying pagination. A 403 during enumeration ends
/// that stream without failing the run; a 404 on any fetch is `NotFound`.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Cheap authenticated call made once at startup. An auth failure here
    /// means the whole instance is unusable and the run must not start.
    async fn check_auth(&self) -> AdapterResult<()>;

    fn projects<'a>(&'a self, opts: &ScopeOptions) -> BoxStream<'a, AdapterResult<Project>>;

    fn jobs<'a>(&'a self, project: &Project) -> BoxStream<'a, AdapterResult<JobMeta>>;

    async fn fetch_job_trace(&self, meta: &JobMeta) -> AdapterResult<Fetched>;

    async fn fetch_job_artifact(&self, meta: &JobMeta) -> AdapterResult<Fetched>;

    /// Session-cookie based environment dump. Platforms without the concept
    /// return `NotFound`.
    async fn fetch_dotenv(&self, meta: &JobMeta) -> AdapterResult<Fetched>;

    /// Deterministic, network-free permalink for a job.
    fn job_url(&self, meta: &JobMeta) -> String;
}

/// Bundle a set of named downloads into one stored (uncompressed) zip so the
/// archive walker can treat a multi-artifact job as a single container.
pub(crate) fn pack_downloads(downloads: Vec<(String, Vec<u8>)>) -> std::io::Result<Vec<u8>> {
    use std::io::Write;
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, bytes) in downloads {
        writer.start_file(name, options)?;
        writer.write_all(&bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}
