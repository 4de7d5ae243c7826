use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use sattach_common::{AttachConfig, StepId};
use sattach_core::{AttachCoordinator, StaticLayoutSource, TaskCallbacks, TaskStateTracker};
use sattach_transport::TcpTransport;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const WAIT_TICK: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "sattach", version, about = "Attach to a running job step")]
struct Cli {
    /// Job step to attach to, as JOB or JOB.STEP
    step: StepId,

    /// More output; repeat for more
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Less output; repeat for less
    #[arg(short, long, action = ArgAction::Count)]
    quiet: u8,

    /// Path to sattach.toml (or use SATTACH_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Step layout file (or use SATTACH_LAYOUT_FILE)
    #[arg(long)]
    layout_file: Option<PathBuf>,

    /// Attach on behalf of this uid instead of the caller
    #[arg(long)]
    uid: Option<u32>,

    /// Return once the attach request has been answered
    #[arg(long)]
    no_wait: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, quiet: u8) {
    let level = match i16::from(verbose) - i16::from(quiet) {
        i16::MIN..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = AttachConfig::load(cli.config.as_deref())?;

    let Some(layout_file) = cli.layout_file.or_else(|| config.layout_file.clone()) else {
        bail!("no step layout source: pass --layout-file or set SATTACH_LAYOUT_FILE");
    };
    let source = StaticLayoutSource::from_file(&layout_file)?;
    debug!(steps = source.len(), path = %layout_file.display(), "loaded step layouts");

    let uid = cli.uid.unwrap_or_else(|| nix::unistd::getuid().as_raw());
    let transport = TcpTransport::new(config.auth_key_bytes().map(<[u8]>::to_vec));
    let coordinator = AttachCoordinator::new(source, transport, config);

    let mut session = coordinator
        .attach(cli.step, uid, TaskCallbacks::default())
        .await
        .with_context(|| format!("could not attach to job step {}", cli.step))?;

    if !session.report.any_succeeded() {
        error!(step = %cli.step, "no node accepted the attach request");
        tokio::task::spawn_blocking(move || session.shutdown()).await?;
        return Ok(ExitCode::FAILURE);
    }

    if !cli.no_wait {
        spawn_signal_handlers(Arc::clone(&session.tracker));
        wait_for_tasks(Arc::clone(&session.tracker)).await?;
    }

    tokio::task::spawn_blocking(move || session.shutdown()).await?;
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_tasks(tracker: Arc<TaskStateTracker>) -> Result<()> {
    let waiter = Arc::clone(&tracker);
    tokio::task::spawn_blocking(move || {
        while !waiter.wait_until(|s| s.all_exited() || s.is_aborted(), WAIT_TICK) {
            debug!(
                started = waiter.started_count(),
                exited = waiter.exited_count(),
                requested = waiter.requested(),
                "waiting for tasks"
            );
        }
    })
    .await?;

    if tracker.take_abort_action() {
        let live = tracker.live_tasks();
        warn!(live = live.len(), "detaching with tasks still running");
    } else {
        info!(tasks = tracker.requested(), "all tasks exited");
    }
    Ok(())
}

fn spawn_signal_handlers(tracker: Arc<TaskStateTracker>) {
    let ctrl_c_tracker = Arc::clone(&tracker);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; detaching");
            ctrl_c_tracker.abort();
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; detaching");
                tracker.abort();
            }
        });
    }
}
