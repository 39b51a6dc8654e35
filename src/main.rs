use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pingport_rs::config::AppConfig;
use pingport_rs::orchestrator::Orchestrator;
use pingport_rs::primitives::{IcmpPinger, TcpPortChecker};
use pingport_rs::report::{
    format_outcome_line, print_results_table, write_results_json, ResultBoard,
};
use pingport_rs::server::{self, AppState};
use pingport_rs::targets::{dedup_targets, load_targets_from_path, parse_targets};
use pingport_rs::types::{ProbeEvent, ProbeParameters, Target};

/// pingport-rs: ping many hosts at once and check one TCP port on each.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pingport-rs",
    version,
    about = "Ping many hosts concurrently and check one TCP port on each.",
    long_about = None
)]
struct Cli {
    /// Targets separated by commas or whitespace; IPv4 CIDRs expand to hosts.
    #[arg(long)]
    targets: Option<String>,

    /// File with targets (one per line, `#` comments allowed).
    #[arg(long = "targets-file")]
    targets_file: Option<PathBuf>,

    /// Echo requests per target.
    #[arg(long)]
    count: Option<u32>,

    /// TCP port to check on every target.
    #[arg(long)]
    port: Option<u32>,

    /// Skip the TCP port check.
    #[arg(long = "no-port", default_value_t = false)]
    no_port: bool,

    /// TCP connect timeout in milliseconds.
    #[arg(long = "port-timeout-ms")]
    port_timeout_ms: Option<u64>,

    /// Per-echo reply timeout in milliseconds.
    #[arg(long = "ping-timeout-ms")]
    ping_timeout_ms: Option<u64>,

    /// How long a stop waits for tasks before aborting them, in milliseconds.
    #[arg(long = "grace-ms")]
    grace_ms: Option<u64>,

    /// Max targets probed at the same time (0 = unlimited).
    #[arg(long = "max-concurrency")]
    max_concurrency: Option<usize>,

    /// Write results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the HTTP control API instead of running a single batch.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Address for the HTTP control API.
    #[arg(long)]
    bind: Option<String>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// JSON settings file; flags given on the command line win.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn apply_to(&self, cfg: &mut AppConfig) {
        if let Some(c) = self.count {
            cfg.ping_count = c;
        }
        if self.no_port {
            cfg.port = None;
        } else if let Some(p) = self.port {
            cfg.port = Some(p);
        }
        if let Some(ms) = self.port_timeout_ms {
            cfg.port_timeout_ms = ms;
        }
        if let Some(ms) = self.ping_timeout_ms {
            cfg.ping_timeout_ms = ms;
        }
        if let Some(ms) = self.grace_ms {
            cfg.grace_ms = ms;
        }
        if let Some(n) = self.max_concurrency {
            cfg.max_concurrency = Some(n);
        }
        if let Some(b) = &self.bind {
            cfg.bind = b.clone();
        }
    }

    fn collect_targets(&self) -> Result<Vec<Target>> {
        let mut all = Vec::new();
        if let Some(raw) = self.targets.as_deref() {
            all.extend(parse_targets(raw).context("invalid --targets")?);
        }
        if let Some(path) = self.targets_file.as_deref() {
            all.extend(load_targets_from_path(path)?);
        }
        Ok(dedup_targets(all))
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut cfg = AppConfig::load(cli.config.as_deref())?;
    cli.apply_to(&mut cfg);
    let params = cfg
        .probe_parameters()
        .context("invalid probe parameters")?;
    let targets = cli.collect_targets()?;

    info!(
        targets = targets.len(),
        ping_count = params.ping_count,
        port = ?params.port,
        port_timeout_ms = params.port_timeout.as_millis() as u64,
        grace_ms = cfg.grace_ms,
        "configuration loaded"
    );

    let (orchestrator, rx) = Orchestrator::with_channel(
        Arc::new(IcmpPinger::new(cfg.echo_timeout())),
        Arc::new(TcpPortChecker),
        cfg.orchestrator_config(),
    );
    let orchestrator = Arc::new(orchestrator);

    if cli.serve_ui {
        return serve(orchestrator, rx, cfg, targets).await;
    }

    if targets.is_empty() {
        bail!("no targets given (use --targets or --targets-file)");
    }
    run_once(orchestrator, rx, targets, params, cli.output).await
}

async fn run_once(
    orchestrator: Arc<Orchestrator>,
    mut rx: mpsc::UnboundedReceiver<ProbeEvent>,
    targets: Vec<Target>,
    params: ProbeParameters,
    output: Option<PathBuf>,
) -> Result<()> {
    let mut board = ResultBoard::new();
    let started = orchestrator.start_batch(targets, params).await?;
    println!(
        "Probing {} targets (batch {}), Ctrl+C to stop...",
        started.total, started.batch_id
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let done = matches!(event, ProbeEvent::BatchComplete(_));
                if let ProbeEvent::Outcome { outcome, .. } = &event {
                    println!("{}", format_outcome_line(outcome));
                }
                board.apply(event);
                if done {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                let report = orchestrator.stop_all().await;
                warn!(stopped = report.stopped, forced = report.forced, "batch interrupted");
                // keep whatever was reported before the stop
                while let Ok(event) = rx.try_recv() {
                    board.apply(event);
                }
                break;
            }
        }
    }

    print_results_table(&board);
    if let Some(path) = output.as_deref() {
        if let Err(e) = write_results_json(path, &board) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }
    Ok(())
}

async fn serve(
    orchestrator: Arc<Orchestrator>,
    rx: mpsc::UnboundedReceiver<ProbeEvent>,
    cfg: AppConfig,
    initial: Vec<Target>,
) -> Result<()> {
    let board = Arc::new(RwLock::new(ResultBoard::new()));
    let pump = server::spawn_event_pump(rx, board.clone());

    if !initial.is_empty() {
        let params = cfg.probe_parameters()?;
        orchestrator.start_batch(initial, params).await?;
    }

    let bind = cfg.bind.clone();
    let state = AppState::new(orchestrator.clone(), board, cfg);
    println!("Serving control API on http://{bind} (Ctrl+C to stop)");
    let result = server::spawn_server(&bind, state, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    orchestrator.shutdown().await;
    pump.abort();
    result
}
