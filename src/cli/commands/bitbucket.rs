use clap::Args;
use url::Url;

use super::scan::ScanArgs;

/// Scan Bitbucket Cloud workspaces.
#[derive(Args, Debug, Clone)]
pub struct BitbucketArgs {
    /// Base URL of the Bitbucket API
    #[arg(
        long = "bitbucket-url",
        value_name = "URL",
        default_value = "https://api.bitbucket.org/2.0"
    )]
    pub bitbucket_url: Url,

    /// Web URL used when building job permalinks
    #[arg(long, value_name = "URL", default_value = "https://bitbucket.org")]
    pub web_url: Url,

    #[command(flatten)]
    pub scan: ScanArgs,
}
