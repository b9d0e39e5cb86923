use clap::Args;
use url::Url;

use super::scan::ScanArgs;

/// Scan a GitLab instance.
#[derive(Args, Debug, Clone)]
pub struct GitlabArgs {
    /// Base URL of the GitLab instance
    #[arg(long = "gitlab-url", value_name = "URL", default_value = "https://gitlab.com")]
    pub gitlab_url: Url,

    #[command(flatten)]
    pub scan: ScanArgs,
}
