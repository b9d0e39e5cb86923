use clap::Args;
use url::Url;

use super::scan::ScanArgs;

/// Scan a Gitea instance.
#[derive(Args, Debug, Clone)]
pub struct GiteaArgs {
    /// Base URL of the Gitea instance
    #[arg(long = "gitea-url", value_name = "URL")]
    pub gitea_url: Url,

    #[command(flatten)]
    pub scan: ScanArgs,
}
