//! Shared harness for the integration scenarios: a wiremock-served GitLab
//! instance, a capturing reporter, and default scan wiring.
#![allow(dead_code)]

use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use cormorant::{
    dedup::FindingDeduper,
    detector::Detector,
    net::HttpClient,
    platform::GitlabAdapter,
    reporter::Reporter,
    rules::{Confidence, RuleSet},
    scheduler::ScanConfig,
    verifier::Verifier,
};

/// Collects every hit record the reporter writes.
#[derive(Clone)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    pub fn records(&self) -> Vec<serde_json::Value> {
        let raw = self.0.lock().unwrap();
        String::from_utf8_lossy(&raw)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("hit records are valid JSON"))
            .collect()
    }
}

pub fn capturing_reporter() -> (Arc<Reporter>, Captured) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let reporter = Reporter::with_writer(Box::new(SharedWriter(buf.clone())), false);
    (Arc::new(reporter), Captured(buf))
}

pub fn detector(confidence: &[Confidence], threads: usize) -> Arc<Detector> {
    let rules = RuleSet::load(confidence, None).expect("builtin rules load");
    let verifier =
        Verifier::new(false, true, CancellationToken::new()).expect("verifier builds");
    Arc::new(Detector::new(
        Arc::new(rules),
        Arc::new(FindingDeduper::new()),
        Arc::new(verifier),
        threads,
    ))
}

pub fn gitlab_adapter(server: &MockServer, cancel: CancellationToken) -> Arc<GitlabAdapter> {
    gitlab_adapter_with_cap(server, cancel, 500 * 1024 * 1024)
}

pub fn gitlab_adapter_with_cap(
    server: &MockServer,
    cancel: CancellationToken,
    max_body: u64,
) -> Arc<GitlabAdapter> {
    let http = HttpClient::builder()
        .max_body(max_body)
        .max_retries(0)
        .build(cancel)
        .expect("client builds");
    Arc::new(GitlabAdapter::new(http, reqwest::Url::parse(&server.uri()).unwrap()))
}

pub fn scan_config(queue_dir: std::path::PathBuf) -> ScanConfig {
    ScanConfig {
        threads: 4,
        artifacts: false,
        job_limit: 0,
        queue_dir: Some(queue_dir),
        scan_dotenv: false,
        progress: false,
        max_artifact_size: 500 * 1024 * 1024,
    }
}

pub async fn mount_auth(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v4/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 1})))
        .mount(server)
        .await;
}

pub async fn mount_single_project(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v4/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"id": 1, "path_with_namespace": "group/app"}
        ])))
        .mount(server)
        .await;
}

pub async fn mount_jobs(server: &MockServer, job_ids: &[u64]) {
    let jobs: Vec<serde_json::Value> = job_ids
        .iter()
        .map(|id| {
            serde_json::json!({"id": id, "name": format!("job-{id}"), "pipeline": {"id": 5}})
        })
        .collect();
    Mock::given(method("GET"))
        .and(path("/api/v4/projects/1/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&jobs))
        .mount(server)
        .await;
}

pub async fn mount_trace(server: &MockServer, job_id: u64, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v4/projects/1/jobs/{job_id}/trace")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

pub async fn mount_artifact(server: &MockServer, job_id: u64, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v4/projects/1/jobs/{job_id}/artifacts")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

pub fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use zip::write::SimpleFileOptions;
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
