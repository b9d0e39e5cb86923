//! Scan orchestration: one producer enumerating the platform into the disk
//! queue, a dispatcher draining the queue into a bounded worker pool, and
//! deterministic termination once the producer is done and the backlog is
//! empty.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    archive,
    detector::Detector,
    findings::Location,
    net::{skippable, HttpError},
    platform::{Fetched, JobMeta, PlatformAdapter, ScopeOptions},
    queue::WorkQueue,
    reporter::Reporter,
    workitem::WorkItem,
};

pub struct ScanConfig {
    /// Worker parallelism; also bounds per-input rule fan-out.
    pub threads: usize,
    /// Download and walk job artifacts, not just traces.
    pub artifacts: bool,
    /// Per-project job cap; zero or negative means unbounded.
    pub job_limit: i64,
    /// Queue directory root; `None` uses the system temp directory.
    pub queue_dir: Option<PathBuf>,
    /// Enqueue the session-cookie dotenv fetch for platforms that have one.
    pub scan_dotenv: bool,
    /// Show enumeration progress on stderr.
    pub progress: bool,
    /// Cap on any single download and on an archive's uncompressed sum.
    pub max_artifact_size: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub projects: u64,
    pub jobs: u64,
    pub items: u64,
    pub findings: u64,
    pub cancelled: bool,
}

/// Run a full scan: authenticate, enumerate, drain, report. Queue files are
/// purged on every exit path, including cancellation.
pub async fn run_scan(
    adapter: Arc<dyn PlatformAdapter>,
    opts: ScopeOptions,
    config: ScanConfig,
    detector: Arc<Detector>,
    reporter: Arc<Reporter>,
    cancel: CancellationToken,
) -> Result<ScanSummary> {
    adapter
        .check_auth()
        .await
        .context("authentication against the instance failed")?;

    let queue_root = match &config.queue_dir {
        Some(dir) => dir.clone(),
        None => std::env::temp_dir(),
    };
    let queue_dir = tempfile::Builder::new()
        .prefix("cormorant-queue-")
        .tempdir_in(&queue_root)
        .with_context(|| format!("failed to create queue directory under {}", queue_root.display()))?
        .keep();
    let queue = WorkQueue::open(&queue_dir).context("failed to initialize the work queue")?;

    let producer = tokio::spawn(produce(
        adapter.clone(),
        opts,
        queue.clone(),
        config.artifacts,
        config.job_limit,
        config.scan_dotenv,
        config.progress,
        cancel.clone(),
    ));

    let consume_outcome = consume(
        adapter,
        queue.clone(),
        detector,
        reporter.clone(),
        config.threads,
        config.max_artifact_size,
        cancel.clone(),
    )
    .await;

    let produce_outcome = producer.await;

    if let Err(e) = queue.delete() {
        warn!(error = %e, "failed to purge queue files");
    }

    let (projects, jobs) = match produce_outcome {
        Ok(counts) => counts,
        Err(join_error) => {
            error!(error = %join_error, "producer task died");
            (0, 0)
        }
    };
    let items = consume_outcome?;

    Ok(ScanSummary {
        projects,
        jobs,
        items,
        findings: reporter.hits(),
        cancelled: cancel.is_cancelled(),
    })
}

/// Enumerate projects and jobs, pushing work items to the queue. Per job the
/// order is trace, artifact, dotenv. Returns (projects, jobs) seen.
#[allow(clippy::too_many_arguments)]
async fn produce(
    adapter: Arc<dyn PlatformAdapter>,
    opts: ScopeOptions,
    queue: WorkQueue,
    artifacts: bool,
    job_limit: i64,
    scan_dotenv: bool,
    progress_enabled: bool,
    cancel: CancellationToken,
) -> (u64, u64) {
    use futures::StreamExt;

    let progress = if progress_enabled {
        let style = ProgressStyle::with_template("{spinner} {msg} [{elapsed_precise}]")
            .expect("progress bar style template should compile");
        let pb = ProgressBar::new_spinner()
            .with_style(style)
            .with_message("Enumerating projects...");
        pb.enable_steady_tick(Duration::from_millis(500));
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut projects_seen = 0u64;
    let mut jobs_seen = 0u64;

    let mut projects = adapter.projects(&opts);
    'projects: while let Some(next) = projects.next().await {
        if cancel.is_cancelled() {
            break;
        }
        let project = match next {
            Ok(project) => project,
            Err(e) => {
                progress.suspend(|| error!(error = %e, "project enumeration failed; stopping discovery"));
                break;
            }
        };
        projects_seen += 1;
        progress.set_message(format!("Enumerating {} (project {projects_seen})", project.path));
        progress.tick();

        let mut enqueued_for_project = 0i64;
        let mut jobs = adapter.jobs(&project);
        while let Some(next) = jobs.next().await {
            if cancel.is_cancelled() {
                break 'projects;
            }
            let meta = match next {
                Ok(meta) => meta,
                Err(e) => {
                    progress.suspend(|| {
                        warn!(project = project.path, error = %e, "job enumeration failed; skipping rest of project")
                    });
                    break;
                }
            };
            if job_limit > 0 && enqueued_for_project >= job_limit {
                debug!(project = project.path, job_limit, "job limit reached");
                break;
            }
            enqueued_for_project += 1;
            jobs_seen += 1;

            let mut items = vec![WorkItem::JobTrace { meta: meta.clone() }];
            if artifacts {
                items.push(WorkItem::Artifact { meta: meta.clone(), size_hint: None });
            }
            if scan_dotenv {
                items.push(WorkItem::DotEnvArtifact { meta: meta.clone() });
            }
            for item in items {
                match item.encode() {
                    Ok(bytes) => {
                        if let Err(e) = queue.put(&bytes) {
                            progress.suspend(|| error!(error = %e, "queue unusable; stopping discovery"));
                            break 'projects;
                        }
                    }
                    Err(e) => progress.suspend(|| warn!(error = %e, "failed to encode work item")),
                }
            }
        }
    }

    queue.finish();
    progress.finish_with_message(format!(
        "Enumerated {projects_seen} project(s), {jobs_seen} job(s)"
    ));
    (projects_seen, jobs_seen)
}

/// Drain the queue into a worker pool bounded by a semaphore. A worker that
/// panics is not restarted; the run aborts only when every slot has died.
async fn consume(
    adapter: Arc<dyn PlatformAdapter>,
    queue: WorkQueue,
    detector: Arc<Detector>,
    reporter: Arc<Reporter>,
    threads: usize,
    max_artifact_size: u64,
    cancel: CancellationToken,
) -> Result<u64> {
    let semaphore = Arc::new(Semaphore::new(threads));
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut rx = queue.read_chan(cancel.clone());
    let mut items = 0u64;
    let mut dead_workers = 0usize;

    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = rx.recv() => record,
        };
        let Some(record) = record else {
            break;
        };
        let item = match WorkItem::decode(&record) {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "undecodable queue record; skipping");
                continue;
            }
        };
        items += 1;

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let adapter = adapter.clone();
        let detector = detector.clone();
        let reporter = reporter.clone();
        let cancel_worker = cancel.clone();
        workers.spawn(async move {
            let _permit = permit;
            if let Err(e) = process_item(
                &*adapter,
                &detector,
                &reporter,
                item,
                max_artifact_size,
                &cancel_worker,
            )
            .await
            {
                debug!(error = %e, "work item abandoned");
            }
        });

        // Reap finished workers without blocking the dispatch loop.
        while let Some(outcome) = workers.try_join_next() {
            if let Err(e) = outcome {
                if e.is_panic() {
                    dead_workers += 1;
                    error!(dead_workers, "worker panicked: {e}");
                }
            }
        }
        if dead_workers >= threads {
            cancel.cancel();
            bail!("all {threads} workers have died; aborting the scan");
        }
    }

    while let Some(outcome) = workers.join_next().await {
        if let Err(e) = outcome {
            if e.is_panic() {
                dead_workers += 1;
                error!(dead_workers, "worker panicked: {e}");
            }
        }
    }
    if dead_workers >= threads && threads > 0 {
        bail!("all {threads} workers have died; aborting the scan");
    }
    Ok(items)
}

/// Worker body: fetch, walk, detect, report. Single-item failures are
/// logged and swallowed so one bad resource never takes down the run.
async fn process_item(
    adapter: &dyn PlatformAdapter,
    detector: &Detector,
    reporter: &Reporter,
    item: WorkItem,
    max_artifact_size: u64,
    cancel: &CancellationToken,
) -> Result<(), HttpError> {
    if cancel.is_cancelled() {
        return Ok(());
    }
    let meta = item.meta().clone();
    debug!(job = meta.job_id, kind = item.kind(), "fetching");

    let (fetched, container_name) = match &item {
        WorkItem::JobTrace { .. } => (adapter.fetch_job_trace(&meta).await, "trace.log".to_owned()),
        WorkItem::Artifact { .. } => {
            (adapter.fetch_job_artifact(&meta).await, "artifacts.zip".to_owned())
        }
        WorkItem::DotEnvArtifact { .. } => (adapter.fetch_dotenv(&meta).await, ".env.gz".to_owned()),
    };
    let bytes = match fetched {
        Ok(Fetched::Bytes(bytes)) => bytes,
        Ok(Fetched::NotFound) => {
            debug!(job = meta.job_id, kind = item.kind(), "resource not found");
            return Ok(());
        }
        Err(e) => {
            if skippable(&e) {
                warn!(job = meta.job_id, kind = item.kind(), error = %e, "fetch failed; skipping item");
                return Ok(());
            }
            return Err(e);
        }
    };

    debug!(job = meta.job_id, bytes = bytes.len(), "walking");
    let entries = match archive::walk(&container_name, bytes, max_artifact_size) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(job = meta.job_id, error = %e, "corrupt container; skipping item");
            return Ok(());
        }
    };

    let location = base_location(adapter, &meta);
    for entry in entries {
        if cancel.is_cancelled() {
            return Ok(());
        }
        debug!(job = meta.job_id, entry = entry.name, "detecting");
        let findings = if entry.chain.len() > 1 {
            detector
                .detect_file(
                    Arc::new(entry.bytes),
                    &location,
                    &entry.name,
                    Some(entry.chain),
                )
                .await
        } else {
            detector.detect(Arc::new(entry.bytes), &location).await
        };
        for finding in &findings {
            reporter.report(finding);
        }
        if !findings.is_empty() {
            info!(
                job = meta.job_id,
                count = findings.len(),
                "reported findings for {}",
                location.job_url
            );
        }
    }
    Ok(())
}

fn base_location(adapter: &dyn PlatformAdapter, meta: &JobMeta) -> Location {
    Location {
        platform: meta.platform,
        project_path: meta.project_path.clone(),
        job_id: meta.job_id.clone(),
        job_name: meta.job_name.clone(),
        job_url: adapter.job_url(meta),
        file_path: None,
        archive_chain: None,
    }
}
