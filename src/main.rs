//! Vastra - DAST scan engine CLI
//!
//! Feeds raw captured HTTP requests through the scan engine and writes the
//! resulting envelope as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vastra::browser::NoBrowser;
use vastra::config::{DastScanPolicy, ScanSettings, ScanStrategy};
use vastra::http::{HttpTransport, TransportConfig};
use vastra::rulepack;
use vastra::ScanEngine;

/// DAST scan engine
#[derive(Parser, Debug)]
#[command(name = "vastra")]
#[command(author, version, about = "Mutation-driven DAST scan engine", long_about = None)]
struct Cli {
    /// Raw HTTP request file(s) to scan
    #[arg(short, long, required = true)]
    request: Vec<PathBuf>,

    /// Rulepack file (JSON module definitions)
    #[arg(short = 'p', long, env = "VASTRA_RULEPACK")]
    rulepack: PathBuf,

    /// CVE-variant rulepack file, merged over the base rulepack
    #[arg(long, env = "VASTRA_CVE_RULEPACK")]
    cve_rulepack: Option<PathBuf>,

    /// Target host; derived from the first request when omitted
    #[arg(long)]
    host: Option<String>,

    /// Domain(s) allowed to receive attack traffic; unrestricted when empty
    #[arg(long = "allow", env = "VASTRA_ALLOW")]
    allowlist: Vec<String>,

    /// Scan strategy (FAST, SMART, COMPREHENSIVE)
    #[arg(long, default_value = "SMART", env = "VASTRA_STRATEGY")]
    strategy: String,

    /// Passive-only scanning (no attack traffic)
    #[arg(long, env = "VASTRA_PASSIVE")]
    passive: bool,

    /// Maximum attack requests per second
    #[arg(long, default_value = "20", env = "VASTRA_RPS")]
    rps: u32,

    /// Number of concurrent workers
    #[arg(long, default_value = "4", env = "VASTRA_CONCURRENCY")]
    concurrency: usize,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value = "30000", env = "VASTRA_TIMEOUT_MS")]
    timeout_ms: u64,

    /// Overall scan deadline in seconds
    #[arg(long, default_value = "600", env = "VASTRA_DEADLINE_SECS")]
    deadline_secs: u64,

    /// Envelope output path; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "VASTRA_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables file logging)
    #[arg(long, env = "VASTRA_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, env = "VASTRA_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Vastra");

    let modules = load_rulepack(&cli)?;
    tracing::info!(modules = modules.len(), "Rulepack loaded");

    let requests = cli
        .request
        .iter()
        .map(|path| {
            std::fs::read(path).with_context(|| format!("Failed to read request file {:?}", path))
        })
        .collect::<Result<Vec<_>>>()?;

    let host = match &cli.host {
        Some(host) => host.clone(),
        None => {
            let first = requests.first().context("No request files given")?;
            vastra::http::parse(first)
                .map(|schema| schema.host())
                .context("Failed to parse first request file")?
        }
    };

    let settings = ScanSettings {
        max_requests_per_second: cli.rps,
        concurrency: cli.concurrency,
        scan_strategy: cli.strategy.parse::<ScanStrategy>()?,
        run_cve: cli.cve_rulepack.is_some(),
        dast_scan_policy: if cli.passive {
            DastScanPolicy::Passive
        } else {
            DastScanPolicy::Active
        },
        request_timeout_ms: cli.timeout_ms,
    }
    .normalized();

    let transport = HttpTransport::new(TransportConfig {
        timeout_ms: settings.request_timeout_ms,
        ..Default::default()
    })
    .context("Failed to build HTTP transport")?;

    let engine = ScanEngine::new(
        &host,
        cli.allowlist.clone(),
        modules,
        settings,
        Arc::new(transport),
        Arc::new(NoBrowser),
    );
    engine.start();

    for raw in &requests {
        engine.enqueue_request(raw);
    }

    tokio::select! {
        done = engine.wait_for_idle(Duration::from_secs(cli.deadline_secs)) => {
            if !done {
                tracing::warn!(deadline_secs = cli.deadline_secs, "Scan deadline reached");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping scan");
        }
    }
    engine.stop();

    let envelope = engine.envelope();
    let json = serde_json::to_string_pretty(&envelope).context("Failed to serialize envelope")?;
    match &cli.output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write envelope to {:?}", path))?;
            tracing::info!(path = %path.display(), findings = envelope.findings.len(), "Envelope written");
        }
        None => println!("{}", json),
    }

    Ok(())
}

fn load_rulepack(cli: &Cli) -> Result<Vec<rulepack::ModuleDefinition>> {
    let base = std::fs::File::open(&cli.rulepack)
        .with_context(|| format!("Failed to open rulepack {:?}", cli.rulepack))?;
    let cve = cli.cve_rulepack.as_ref().map(|path| {
        std::fs::File::open(path)
            .map_err(|e| vastra::error::RulepackError::NotFound(e.to_string()))
            .and_then(rulepack::load_modules)
    });
    rulepack::load_with_cve(base, cve).context("Failed to load rulepack")
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        let path = std::path::Path::new(log_path);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("vastra.log");
        let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, filename);

        if cli.log_json {
            let file_layer = fmt::layer().json().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        } else {
            let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        }
    } else if cli.log_json {
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    Ok(())
}
