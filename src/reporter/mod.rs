//! Finding output.
//!
//! Findings go to stdout as one JSON record per line with a distinct
//! `"level":"hit"` field, so downstream tooling can separate hits from the
//! ordinary log stream on stderr. The human summary at the end of a run is
//! styled for terminals.

pub mod styles;

use std::{
    io::Write,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::{findings::Finding, scheduler::ScanSummary};
use styles::Styles;

/// One emitted hit line.
#[derive(Debug, Serialize)]
pub struct HitRecord<'a> {
    pub timestamp: String,
    pub level: &'static str,
    pub rule_name: &'a str,
    pub confidence: crate::rules::Confidence,
    pub matched_text_redacted: &'a str,
    pub context_before: &'a str,
    pub context_after: &'a str,
    pub platform: crate::platform::Platform,
    pub project: &'a str,
    pub location_url: &'a str,
    pub job_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_chain: Option<&'a [String]>,
    pub verified: crate::findings::Verified,
}

impl<'a> HitRecord<'a> {
    fn from_finding(finding: &'a Finding) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            level: "hit",
            rule_name: &*finding.rule_name,
            confidence: finding.confidence,
            matched_text_redacted: &finding.redacted_text,
            context_before: &finding.context_before,
            context_after: &finding.context_after,
            platform: finding.location.platform,
            project: &finding.location.project_path,
            location_url: &finding.location.job_url,
            job_name: &finding.location.job_name,
            file_path: finding.location.file_path.as_deref(),
            archive_chain: finding.location.archive_chain.as_deref(),
            verified: finding.verified,
        }
    }
}

pub struct Reporter {
    writer: Mutex<Box<dyn Write + Send>>,
    styles: Styles,
    hits: AtomicU64,
}

impl Reporter {
    pub fn to_stdout(use_color: bool) -> Self {
        Self::with_writer(Box::new(std::io::stdout()), use_color)
    }

    pub fn with_writer(writer: Box<dyn Write + Send>, use_color: bool) -> Self {
        Self { writer: Mutex::new(writer), styles: Styles::new(use_color), hits: AtomicU64::new(0) }
    }

    /// Emit one hit line. Serialization problems are logged, never fatal.
    pub fn report(&self, finding: &Finding) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        let record = HitRecord::from_finding(finding);
        let mut writer = self.writer.lock();
        if let Err(e) = write_jsonl(&mut *writer, &record) {
            warn!(error = %e, "failed to write hit record");
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Styled end-of-run summary on stderr.
    pub fn render_summary(&self, summary: &ScanSummary) {
        let headline = if summary.cancelled {
            self.styles.heading.apply_to("Scan interrupted").to_string()
        } else {
            self.styles.heading.apply_to("Scan complete").to_string()
        };
        let hits = self.styles.hit_count.apply_to(format!("{} hit(s)", summary.findings));
        eprintln!(
            "{headline}: {hits} across {} project(s), {} job(s), {} work item(s)",
            summary.projects, summary.jobs, summary.items
        );
    }
}

fn write_jsonl<W: Write>(mut writer: W, record: &HitRecord<'_>) -> std::io::Result<()> {
    serde_json::to_writer(&mut writer, record)?;
    writeln!(writer)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        findings::{Location, Verified},
        platform::Platform,
        rules::Confidence,
    };

    fn finding() -> Finding {
        Finding {
            rule_name: "aws-access-key".into(),
            confidence: Confidence::High,
            matched_text: "AKIA0123456789ABCDEF".into(),
            redacted_text: "AKIA01**************".into(),
            context_before: "export AWS_ACCESS_KEY_ID=".into(),
            context_after: " && deploy".into(),
            location: Location {
                platform: Platform::Gitlab,
                project_path: "group/app".into(),
                job_id: "1001".into(),
                job_name: "deploy".into(),
                job_url: "https://gitlab.example.com/group/app/-/jobs/1001".into(),
                file_path: Some("creds.txt".into()),
                archive_chain: Some(vec![
                    "outer.zip".into(),
                    "inner.zip".into(),
                    "creds.txt".into(),
                ]),
            },
            verified: Verified::Unknown,
        }
    }

    #[test]
    fn hit_record_is_one_json_line() {
        let mut output = Cursor::new(Vec::new());
        write_jsonl(&mut output, &HitRecord::from_finding(&finding())).unwrap();
        let raw = output.into_inner();
        let text = String::from_utf8(raw).unwrap();
        assert_eq!(text.lines().count(), 1);

        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["level"], "hit");
        assert_eq!(value["rule_name"], "aws-access-key");
        assert_eq!(value["confidence"], "high");
        assert_eq!(value["matched_text_redacted"], "AKIA01**************");
        assert_eq!(value["location_url"], "https://gitlab.example.com/group/app/-/jobs/1001");
        assert_eq!(value["archive_chain"][2], "creds.txt");
        assert_eq!(value["verified"], "unknown");
    }

    #[test]
    fn raw_match_never_reaches_the_output() {
        let mut output = Cursor::new(Vec::new());
        write_jsonl(&mut output, &HitRecord::from_finding(&finding())).unwrap();
        let text = String::from_utf8(output.into_inner()).unwrap();
        assert!(!text.contains("AKIA0123456789ABCDEF"));
    }

    #[test]
    fn absent_archive_chain_is_omitted() {
        let mut plain = finding();
        plain.location.file_path = None;
        plain.location.archive_chain = None;
        let mut output = Cursor::new(Vec::new());
        write_jsonl(&mut output, &HitRecord::from_finding(&plain)).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(String::from_utf8(output.into_inner()).unwrap().trim()).unwrap();
        assert!(value.get("archive_chain").is_none());
        assert!(value.get("file_path").is_none());
    }

    #[test]
    fn reporter_counts_hits() {
        let reporter = Reporter::with_writer(Box::new(std::io::sink()), false);
        assert_eq!(reporter.hits(), 0);
        reporter.report(&finding());
        reporter.report(&finding());
        assert_eq!(reporter.hits(), 2);
    }
}
