//! CLI entry point: `start` runs in the foreground, `daemon`
//! re-execs itself detached and records a pidfile, `stop` signals a running
//! daemon via its pidfile.

use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use feathermail_config::{resolve_config_dir, PipelineLoader};
use feathermail_pipeline::Registry;

#[derive(Parser)]
#[command(name = "feathermail", version, about = "A closed-registry SMTP server.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in the foreground, logging to stderr.
    Start,
    /// Re-exec detached in the background and write a pidfile.
    Daemon,
    /// Signal a running daemon (via its pidfile) to stop.
    Stop,
}

fn pidfile_path(config_dir: &Path) -> PathBuf {
    std::env::var("FEATHER_PIDFILE").map(PathBuf::from).unwrap_or_else(|_| config_dir.join("feathermail.pid"))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config_dir = resolve_config_dir();

    match cli.command {
        Command::Start => run_start(&config_dir),
        Command::Daemon => run_daemon(&config_dir),
        Command::Stop => run_stop(&config_dir),
    }
}

/// Re-execs `self start`, stdio redirected to null, then records its pid.
/// Not a real double-fork daemonization — process supervision stays thin
/// rather than hand-rolling `fork()`/`setsid()` unsafety in an async binary.
fn run_daemon(config_dir: &Path) -> ExitCode {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(error) => {
            tracing::error!(%error, "could not resolve own executable path");
            return ExitCode::from(3);
        }
    };

    let child = std::process::Command::new(exe)
        .arg("start")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(error) => {
            tracing::error!(%error, "failed to spawn detached process");
            return ExitCode::from(3);
        }
    };

    let pidfile = pidfile_path(config_dir);
    if let Err(error) = std::fs::write(&pidfile, child.id().to_string()) {
        tracing::error!(%error, path = %pidfile.display(), "failed to write pidfile");
        return ExitCode::from(3);
    }

    tracing::info!(pid = child.id(), path = %pidfile.display(), "daemonized");
    ExitCode::SUCCESS
}

fn run_stop(config_dir: &Path) -> ExitCode {
    let pidfile = pidfile_path(config_dir);
    let contents = match std::fs::read_to_string(&pidfile) {
        Ok(contents) => contents,
        Err(error) => {
            tracing::error!(%error, path = %pidfile.display(), "could not read pidfile");
            return ExitCode::from(3);
        }
    };

    let pid: i32 = match contents.trim().parse() {
        Ok(pid) => pid,
        Err(error) => {
            tracing::error!(%error, contents = %contents.trim(), "pidfile did not contain a valid pid");
            return ExitCode::from(3);
        }
    };

    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM) {
        Ok(()) => {
            let _ = std::fs::remove_file(&pidfile);
            tracing::info!(pid, "sent SIGTERM");
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(%error, pid, "failed to signal process");
            ExitCode::from(3)
        }
    }
}

fn run_start(config_dir: &Path) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "failed to start async runtime");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async_start(config_dir))
}

async fn async_start(config_dir: &Path) -> ExitCode {
    let server_config = match feathermail_config::load_server_config(config_dir) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "failed to load server.json");
            return ExitCode::from(3);
        }
    };

    let store = feathermail_store::Store::new();
    let _sweeper = store.spawn_sweeper(std::time::Duration::from_secs(60));
    let registry: Arc<Registry> = feathermail_stages::build_registry(store);

    let pipeline_path = config_dir.join("pipeline.json");
    let pipeline = match PipelineLoader::load(pipeline_path.clone(), registry) {
        Ok(loader) => loader,
        Err(error) => {
            tracing::error!(%error, path = %pipeline_path.display(), "failed to load pipeline.json");
            return ExitCode::from(3);
        }
    };

    let _watcher = match pipeline.spawn_watcher() {
        Ok(watcher) => Some(watcher),
        Err(error) => {
            tracing::warn!(%error, "pipeline file watcher unavailable, reload on edit disabled");
            None
        }
    };

    match feathermail_server::serve(server_config, pipeline).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(feathermail_server::ServerError::Bind(_, _)) => ExitCode::from(1),
        Err(feathermail_server::ServerError::TlsSetup(_)) => ExitCode::from(2),
    }
}
