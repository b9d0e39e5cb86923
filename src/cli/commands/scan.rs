use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Args;

use crate::{platform::ScopeOptions, rules::Confidence};

/// Scan options shared by every platform subcommand.
#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// API token for the instance
    #[arg(long, env = "CORMORANT_TOKEN", hide_env_values = true, value_name = "TOKEN")]
    pub token: String,

    /// Web session cookie; enables the dotenv artifact path where supported
    #[arg(long, env = "CORMORANT_COOKIE", hide_env_values = true, value_name = "COOKIE")]
    pub cookie: Option<String>,

    /// Also download and scan job artifacts
    #[arg(long)]
    pub artifacts: bool,

    /// Skip any single resource larger than this (e.g. "500MiB", "1GB")
    #[arg(long, default_value = "500MiB", value_parser = parse_byte_size, value_name = "SIZE")]
    pub max_artifact_size: u64,

    /// Worker parallelism
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=100), value_name = "N")]
    pub threads: u8,

    /// Per-project job cap; 0 or negative scans every job
    #[arg(long, default_value_t = 0, allow_hyphen_values = true, value_name = "N")]
    pub job_limit: i64,

    /// Only run rules of these confidences (comma separated); empty runs all
    #[arg(long, value_delimiter = ',', value_name = "LEVELS")]
    pub confidence: Vec<Confidence>,

    /// Disable live credential verification
    #[arg(long)]
    pub no_verification: bool,

    /// Only projects owned by the token's user
    #[arg(long)]
    pub owned: bool,

    /// Only projects the token's user is a member of
    #[arg(long)]
    pub member: bool,

    /// Only publicly visible projects
    #[arg(long)]
    pub public: bool,

    /// Project search term
    #[arg(long, value_name = "TERM")]
    pub search: Option<String>,

    /// Restrict to one namespace / group / organization / workspace
    #[arg(long, value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Scan a single repository (full path, e.g. group/app)
    #[arg(long, value_name = "PATH")]
    pub repo: Option<String>,

    /// Only projects with activity after this instant (RFC 3339)
    #[arg(long, value_name = "WHEN")]
    pub after: Option<DateTime<Utc>>,

    /// Directory for queue files; defaults to the system temp directory
    #[arg(long, value_name = "DIR")]
    pub queue: Option<PathBuf>,

    /// Extra rule file merged over the builtin rules
    #[arg(long, value_name = "FILE")]
    pub rules: Option<PathBuf>,
}

impl ScanArgs {
    pub fn scope_options(&self) -> ScopeOptions {
        ScopeOptions {
            owned: self.owned,
            member: self.member,
            public: self.public,
            search: self.search.clone(),
            namespace: self.namespace.clone(),
            repo: self.repo.clone(),
            after: self.after,
        }
    }
}

/// Parse a human-readable byte size: bare bytes, decimal (KB/MB/GB) or
/// binary (KiB/MiB/GiB) suffixes, case-insensitive.
pub fn parse_byte_size(raw: &str) -> Result<u64, String> {
    let text = raw.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid size {raw:?}: expected a number with an optional unit"))?;
    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1000,
        "mb" | "m" => 1000 * 1000,
        "gb" | "g" => 1000 * 1000 * 1000,
        "kib" => 1024,
        "mib" => 1024 * 1024,
        "gib" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit {other:?}")),
    };
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 {
        return Err(format!("invalid size {raw:?}"));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn byte_sizes_parse() {
        assert_eq!(parse_byte_size("500MiB"), Ok(500 * 1024 * 1024));
        assert_eq!(parse_byte_size("1GB"), Ok(1_000_000_000));
        assert_eq!(parse_byte_size("42"), Ok(42));
        assert_eq!(parse_byte_size("10kb"), Ok(10_000));
        assert_eq!(parse_byte_size("1.5 MiB"), Ok(1_572_864));
        assert_eq!(parse_byte_size("0"), Ok(0));
    }

    #[test]
    fn garbage_sizes_are_rejected() {
        assert!(parse_byte_size("lots").is_err());
        assert!(parse_byte_size("10parsecs").is_err());
        assert!(parse_byte_size("").is_err());
    }
}
