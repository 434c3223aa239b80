use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rewind::config::Config;
use rewind::supervisor::{self, SessionManager};
use rewind::tracer;
use rewind::util::{signals, Paths};
use rewind::web::{run_server, WebAppState};

/// Time-travel debugger: trace a script, then step and rewind it from a client.
#[derive(Parser)]
#[command(name = "rewind", version)]
struct Cli {
    /// State directory [default: ~/.rewind]
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP and websocket API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run, checkpoint and restore the active target
    Watch,
    /// Run a script under the tracer
    Trace {
        /// Script to trace [default: the uploaded target]
        script: Option<PathBuf>,
        /// Record without a watcher or client and print output here
        #[arg(long)]
        standalone: bool,
    },
}

impl Command {
    fn role(&self) -> &'static str {
        match self {
            Command::Serve { .. } => "serve",
            Command::Watch => "watch",
            Command::Trace { .. } => "trace",
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let paths = Paths::resolve(cli.data_dir);

    // Logs go to <data-dir>/logs/<role>.log; the traced child's own
    // stdout and stderr belong to the script.
    if let Err(e) = init_logging(&paths, cli.command.role()) {
        eprintln!("rewind: {e:#}");
        return ExitCode::from(2);
    }
    let config = Config::load(paths);

    match cli.command {
        Command::Serve { host, port } => match serve(config, host, port) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Server failed");
                eprintln!("rewind: {e:#}");
                ExitCode::FAILURE
            }
        },
        Command::Watch => {
            let shutdown = signals::install_stop_handler();
            match supervisor::watch(&config, shutdown) {
                Ok(outcome) => {
                    if outcome == supervisor::WatchOutcome::NoActiveTarget {
                        eprintln!("rewind: no active target to watch");
                    }
                    exit_code(outcome.exit_code())
                }
                Err(e) => {
                    tracing::error!(error = %e, "Watcher failed");
                    eprintln!("rewind: {e}");
                    exit_code(e.exit_code())
                }
            }
        }
        Command::Trace { script, standalone } => {
            let interrupt = signals::install_stop_handler();
            let script = script.unwrap_or_else(|| config.target_script());
            match tracer::run(&config, &script, standalone, interrupt) {
                Ok(outcome) => exit_code(outcome.exit_code()),
                Err(e) => {
                    tracing::error!(error = %e, "Trace failed");
                    eprintln!("rewind: {e}");
                    ExitCode::from(2)
                }
            }
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn init_logging(paths: &Paths, role: &str) -> Result<()> {
    fs::create_dir_all(paths.logs_dir()).context("Failed to create log directory")?;

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file(role))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(log_file)
        .with_ansi(false) // Disable ANSI colors in log file
        .init();
    Ok(())
}

fn serve(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async {
        let session = Arc::new(
            SessionManager::from_config(&config).context("Failed to open session state")?,
        );
        let state = WebAppState::new(session, config.session.poll_interval);
        eprintln!(
            "rewind: serving on http://{}:{}",
            config.server.host, config.server.port
        );

        run_server(state, &config.server, signals::shutdown_signal()).await
    })
}
