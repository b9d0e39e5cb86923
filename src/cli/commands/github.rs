use clap::Args;
use url::Url;

use super::scan::ScanArgs;

/// Scan GitHub or a GitHub Enterprise instance.
#[derive(Args, Debug, Clone)]
pub struct GithubArgs {
    /// Base URL of the GitHub instance
    #[arg(long = "github-url", value_name = "URL", default_value = "https://github.com")]
    pub github_url: Url,

    #[command(flatten)]
    pub scan: ScanArgs,
}

impl GithubArgs {
    /// API root for the configured instance: `api.github.com` for the
    /// public service, the `/api/v3` prefix for GitHub Enterprise.
    pub fn api_url(&self) -> Url {
        if self.github_url.host_str() == Some("github.com") {
            Url::parse("https://api.github.com").expect("static URL")
        } else {
            let mut api = self.github_url.clone();
            api.set_path("api/v3");
            api
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn args(url: &str) -> GithubArgs {
        use clap::Parser;
        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            github: GithubArgs,
        }
        Wrapper::parse_from(["test", "--github-url", url, "--token", "t"]).github
    }

    #[test]
    fn public_github_uses_api_subdomain() {
        assert_eq!(args("https://github.com").api_url().as_str(), "https://api.github.com/");
    }

    #[test]
    fn enterprise_uses_api_v3_prefix() {
        assert_eq!(
            args("https://ghe.corp.example").api_url().as_str(),
            "https://ghe.corp.example/api/v3"
        );
    }
}
