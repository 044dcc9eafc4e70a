//! OpenDLP agent binary entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use opendlp_agent::transport::HttpTransport;
use opendlp_agent::{Agent, AgentPorts};
use opendlp_core::config::{AgentConfig, Timings, ENV_LOG_DIR};
use opendlp_monitors::clipboard::NullClipboard;
use opendlp_monitors::usb::{NullDriveProvider, NullUsbPort};
use opendlp_monitors::Running;

/// OpenDLP - endpoint data-loss-prevention agent.
#[derive(Parser, Debug)]
#[command(name = "opendlp-agent", version, about)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "agent_config.json")]
    config: String,

    /// Run in background mode: no console output, log to file.
    #[arg(short = 'b', long, visible_alias = "bg")]
    background: bool,
}

/// Accept the historical single-dash and bare spellings
/// (`-background`, `-bg`, `bg`) by rewriting them before clap runs.
fn normalize_args() -> Vec<std::ffi::OsString> {
    std::env::args_os()
        .map(|arg| {
            match arg.to_str() {
                Some("-background") | Some("-bg") | Some("bg") => "--background".into(),
                _ => arg,
            }
        })
        .collect()
}

fn log_dir() -> PathBuf {
    std::env::var(ENV_LOG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn main() -> std::process::ExitCode {
    let args = Args::parse_from(normalize_args());

    let env_filter = EnvFilter::try_from_env("OPENDLP_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if args.background {
        // Background mode: everything goes to the log file.
        let dir = log_dir();
        let _ = std::fs::create_dir_all(&dir);
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("opendlp_agent.log"))
        {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .init();
            }
            Err(e) => {
                eprintln!("cannot open log file: {e}");
                return std::process::ExitCode::FAILURE;
            }
        }
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match run(&args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal error");
            if !args.background {
                eprintln!("fatal error: {e:#}");
                eprintln!("check that the OpenDLP server is running and reachable,");
                eprintln!("and that server_url in the config file or AGENT_SERVER_URL is correct");
            }
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(async {
        let config = AgentConfig::load(std::path::Path::new(&args.config))
            .context("loading configuration")?;

        let state_dir = log_dir().join("state");
        std::fs::create_dir_all(&state_dir).context("creating state dir")?;
        if config.quarantine.enabled {
            std::fs::create_dir_all(&config.quarantine.folder)
                .context("creating quarantine folder")?;
        }

        let transport = Arc::new(
            HttpTransport::new(&config.server_url, &config.agent_id)
                .context("building transport")?,
        );

        let running = Running::new();
        let ctrl_c_running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                ctrl_c_running.clear();
            }
        });

        // Platform ports. The USB control/notification pump and clipboard
        // integration are OS collaborators; hosts without them get the
        // inert implementations and the corresponding monitors idle.
        let (_device_tx, device_rx) = tokio::sync::mpsc::channel(64);
        let ports = AgentPorts {
            usb_control: Arc::new(NullUsbPort),
            drives: Arc::new(NullDriveProvider),
            clipboard: Box::new(NullClipboard),
            device_events: device_rx,
        };

        let agent = Agent::new(config, transport, Timings::default(), running, state_dir);
        agent.run(ports).await
    })
}
