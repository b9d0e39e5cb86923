//! Command-line surface: one subcommand per supported platform, each
//! flattening the shared scan options and the global flags.

pub mod commands;
pub mod global;

use clap::{Parser, Subcommand};

pub use global::GlobalArgs;

use commands::{
    azure::AzureArgs, bitbucket::BitbucketArgs, gitea::GiteaArgs, github::GithubArgs,
    gitlab::GitlabArgs,
};

#[derive(Parser, Debug)]
#[command(
    name("cormorant"),
    bin_name("cormorant"),
    author,
    about,
    version,
    propagate_version = true
)]
/// Scan CI/CD job logs and build artifacts for leaked secrets
pub struct CommandLineArgs {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub global_args: GlobalArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan a GitLab instance
    #[command(display_order = 1)]
    Gitlab(GitlabArgs),

    /// Scan GitHub or GitHub Enterprise
    #[command(display_order = 2)]
    Github(GithubArgs),

    /// Scan a Gitea instance
    #[command(display_order = 3)]
    Gitea(GiteaArgs),

    /// Scan Bitbucket Cloud
    #[command(display_order = 4)]
    Bitbucket(BitbucketArgs),

    /// Scan an Azure DevOps organization
    #[command(display_order = 5)]
    Azure(AzureArgs),
}

impl CommandLineArgs {
    pub fn parse_args() -> Self {
        let mut args = Self::parse();

        // https://no-color.org/
        if std::env::var("NO_COLOR").is_ok() {
            args.global_args.color = global::Mode::Never;
        }
        if args.global_args.quiet {
            args.global_args.progress = global::Mode::Never;
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        CommandLineArgs::command().debug_assert();
    }

    #[test]
    fn thread_bounds_are_enforced() {
        let err = CommandLineArgs::try_parse_from([
            "cormorant", "gitlab", "--token", "t", "--threads", "0",
        ]);
        assert!(err.is_err());
        let err = CommandLineArgs::try_parse_from([
            "cormorant", "gitlab", "--token", "t", "--threads", "101",
        ]);
        assert!(err.is_err());
        let ok = CommandLineArgs::try_parse_from([
            "cormorant", "gitlab", "--token", "t", "--threads", "100",
        ]);
        assert!(ok.is_ok());
    }

    #[test]
    fn confidence_csv_parses() {
        let args = CommandLineArgs::try_parse_from([
            "cormorant", "gitlab", "--token", "t", "--confidence", "low,high",
        ])
        .unwrap();
        let Command::Gitlab(gitlab) = args.command else {
            panic!("expected gitlab subcommand");
        };
        assert_eq!(gitlab.scan.confidence.len(), 2);
    }

    #[test]
    fn job_limit_accepts_negative_values() {
        let args = CommandLineArgs::try_parse_from([
            "cormorant", "gitlab", "--token", "t", "--job-limit", "-1",
        ])
        .unwrap();
        let Command::Gitlab(gitlab) = args.command else {
            panic!("expected gitlab subcommand");
        };
        assert_eq!(gitlab.scan.job_limit, -1);
    }
}
