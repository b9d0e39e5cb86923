use std::{process::ExitCode, sync::Arc};

use anyhow::{bail, Context, Result};
use base64::Engine;
use http::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cormorant::{
    cli::{self, commands::scan::ScanArgs, Command, GlobalArgs},
    dedup::FindingDeduper,
    detector::Detector,
    net::{validate_base_url, HttpClient, HttpClientBuilder},
    platform::{
        AzureAdapter, BitbucketAdapter, GiteaAdapter, GithubAdapter, GitlabAdapter,
        PlatformAdapter,
    },
    reporter::{styles::Term, Reporter},
    rules::RuleSet,
    scheduler::{self, ScanConfig, ScanSummary},
    verifier::Verifier,
};

/// Conventional exit status after a signal-initiated shutdown.
const EXIT_SIGNALLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::CommandLineArgs::parse_args();
    init_tracing(&args.global_args);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match run(args, cancel).await {
        Ok(summary) if summary.cancelled => {
            restore_terminal();
            ExitCode::from(EXIT_SIGNALLED)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            // The single place that reports a fatal error; the sink flushes
            // and the terminal is restored before the process ends.
            error!("fatal: {e:#}");
            restore_terminal();
            ExitCode::FAILURE
        }
    }
}

async fn run(args: cli::CommandLineArgs, cancel: CancellationToken) -> Result<ScanSummary> {
    let global = args.global_args.clone();
    let (adapter, scan) = build_adapter(args.command, &global, cancel.clone())?;

    if scan.token.trim().is_empty() {
        bail!("--token must not be empty");
    }

    let rules = Arc::new(
        RuleSet::load(&scan.confidence, scan.rules.as_deref())
            .context("failed to load detection rules")?,
    );
    info!(rules = rules.len(), platform = %adapter.platform(), "starting scan");

    let verifier = Verifier::new(!scan.no_verification, global.ignore_proxy, cancel.clone())
        .context("failed to initialize the verifier")?;
    let detector = Arc::new(Detector::new(
        rules,
        Arc::new(FindingDeduper::new()),
        Arc::new(verifier),
        scan.threads as usize,
    ));
    let reporter = Arc::new(Reporter::to_stdout(global.use_color()));

    let config = ScanConfig {
        threads: scan.threads as usize,
        artifacts: scan.artifacts,
        job_limit: scan.job_limit,
        queue_dir: scan.queue.clone(),
        scan_dotenv: scan.cookie.is_some(),
        progress: global.use_progress(),
        max_artifact_size: scan.max_artifact_size,
    };

    let summary = scheduler::run_scan(
        adapter,
        scan.scope_options(),
        config,
        detector,
        reporter.clone(),
        cancel,
    )
    .await?;

    reporter.render_summary(&summary);
    Ok(summary)
}

/// Wire the platform subcommand into an adapter with its authenticated,
/// retrying HTTP client.
fn build_adapter(
    command: Command,
    global: &GlobalArgs,
    cancel: CancellationToken,
) -> Result<(Arc<dyn PlatformAdapter>, ScanArgs)> {
    match command {
        Command::Gitlab(args) => {
            check_url("--gitlab-url", &args.gitlab_url)?;
            let mut builder = client_builder(&args.scan, global)
                .default_header("PRIVATE-TOKEN".parse().expect("static header name"), secret(&args.scan.token)?);
            if let Some(cookie) = &args.scan.cookie {
                builder =
                    builder.cookie(args.gitlab_url.clone(), format!("_gitlab_session={cookie}"));
            }
            let http = builder.build(cancel)?;
            Ok((Arc::new(GitlabAdapter::new(http, args.gitlab_url)), args.scan))
        }
        Command::Github(args) => {
            check_url("--github-url", &args.github_url)?;
            let http = client_builder(&args.scan, global)
                .default_header(AUTHORIZATION, secret(&format!("Bearer {}", args.scan.token))?)
                .default_header(ACCEPT, HeaderValue::from_static("application/vnd.github+json"))
                .build(cancel)?;
            let api = args.api_url();
            Ok((
                Arc::new(GithubAdapter::new(http, api, args.github_url)),
                args.scan,
            ))
        }
        Command::Gitea(args) => {
            check_url("--gitea-url", &args.gitea_url)?;
            let http = client_builder(&args.scan, global)
                .default_header(AUTHORIZATION, secret(&format!("token {}", args.scan.token))?)
                .build(cancel)?;
            Ok((Arc::new(GiteaAdapter::new(http, args.gitea_url)), args.scan))
        }
        Command::Bitbucket(args) => {
            check_url("--bitbucket-url", &args.bitbucket_url)?;
            let http = client_builder(&args.scan, global)
                .default_header(AUTHORIZATION, secret(&format!("Bearer {}", args.scan.token))?)
                .build(cancel)?;
            Ok((
                Arc::new(BitbucketAdapter::new(http, args.bitbucket_url, args.web_url)),
                args.scan,
            ))
        }
        Command::Azure(args) => {
            check_url("--azure-url", &args.azure_url)?;
            let Some(organization) = args.organization() else {
                bail!("azure scans need an organization: pass --namespace ORG or --repo ORG/PROJECT");
            };
            let basic =
                base64::engine::general_purpose::STANDARD.encode(format!(":{}", args.scan.token));
            let http = client_builder(&args.scan, global)
                .default_header(AUTHORIZATION, secret(&format!("Basic {basic}"))?)
                .build(cancel)?;
            Ok((
                Arc::new(AzureAdapter::new(http, args.azure_url, organization)),
                args.scan,
            ))
        }
    }
}

fn client_builder(scan: &ScanArgs, global: &GlobalArgs) -> HttpClientBuilder {
    HttpClient::builder()
        .max_body(scan.max_artifact_size)
        .ignore_proxy(global.ignore_proxy)
}

fn check_url(flag: &str, url: &Url) -> Result<()> {
    validate_base_url(url).map_err(|reason| anyhow::anyhow!("invalid {flag}: {reason}"))
}

/// Header value for a credential: marked sensitive so it never shows up in
/// debug output.
fn secret(value: &str) -> Result<HeaderValue> {
    let mut header = HeaderValue::from_str(value)
        .context("token contains characters that cannot appear in a header")?;
    header.set_sensitive(true);
    Ok(header)
}

fn init_tracing(global: &GlobalArgs) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(global.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(global.use_color())
        .init();
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("shutdown signal received; draining and cleaning up");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Progress bars can leave the cursor hidden; put the terminal back before
/// the process exits on an abnormal path.
fn restore_terminal() {
    let _ = Term::stderr().show_cursor();
}
