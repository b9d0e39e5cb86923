use clap::Args;
use url::Url;

use super::scan::ScanArgs;

/// Scan an Azure DevOps organization.
#[derive(Args, Debug, Clone)]
pub struct AzureArgs {
    /// Base URL of the Azure DevOps instance
    #[arg(long = "azure-url", value_name = "URL", default_value = "https://dev.azure.com")]
    pub azure_url: Url,

    #[command(flatten)]
    pub scan: ScanArgs,
}

impl AzureArgs {
    /// Builds are always organization-scoped: the organization comes from
    /// `--namespace`, or from the `org/project` form of `--repo`.
    pub fn organization(&self) -> Option<String> {
        if let Some(namespace) = &self.scan.namespace {
            return Some(namespace.clone());
        }
        self.scan
            .repo
            .as_deref()
            .and_then(|repo| repo.split_once('/'))
            .map(|(org, _)| org.to_owned())
    }
}
