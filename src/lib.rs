//! cormorant: a CI/CD pipeline secret scanner.
//!
//! Enumerates GitLab, GitHub, Gitea, Bitbucket and Azure DevOps instances
//! for job logs and build artifacts, buffers the discovered work in a
//! durable disk queue, and streams the downloaded bytes through a regex
//! rule set with optional live credential verification.

pub mod archive;
pub mod cli;
pub mod dedup;
pub mod detector;
pub mod findings;
pub mod net;
pub mod platform;
pub mod queue;
pub mod reporter;
pub mod rules;
pub mod scheduler;
pub mod verifier;
pub mod workitem;

pub use detector::Detector;
pub use findings::{Finding, Location, Verified};
pub use platform::{Fetched, JobMeta, Platform, PlatformAdapter, Project, ScopeOptions};
pub use queue::WorkQueue;
pub use rules::{Confidence, Rule, RuleSet};
pub use scheduler::{run_scan, ScanConfig, ScanSummary};
pub use workitem::WorkItem;
