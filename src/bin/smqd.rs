// SPDX-License-Identifier: MIT

//! smqd — the SMQ broker daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with a config file
//! smqd --config listener.toml
//!
//! # Override the bind address from the command line
//! smqd --config listener.toml --bind 0.0.0.0:9000
//! ```
//!
//! Exit codes: 0 clean shutdown, 64 unusable configuration, 73 unrecoverable
//! storage error, 74 bind failure (spec.md §6).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use smq::broker::{Broker, BrokerError};
use smq::config::{ListenerConfig, Protocol};

#[derive(Parser, Debug)]
#[command(name = "smqd")]
#[command(about = "A small message-queue broker", long_about = None)]
struct Args {
    /// Path to a TOML listener configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override `bind` from the config file.
    #[arg(long)]
    bind: Option<String>,

    /// Override `protocol` from the config file.
    #[arg(long, value_enum)]
    protocol: Option<CliProtocol>,

    /// Override `workers` from the config file.
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum CliProtocol {
    Smq,
    Mqtt,
}

const EXIT_CLEAN: i32 = 0;
const EXIT_BAD_CONFIG: i32 = 64;
const EXIT_STORAGE_ERROR: i32 = 73;
const EXIT_BIND_FAILURE: i32 = 74;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let code = match run() {
        Ok(()) => EXIT_CLEAN,
        Err(err) => {
            tracing::error!(error = %err.error, "smqd exiting");
            err.code
        }
    };
    std::process::exit(code);
}

struct ExitError {
    code: i32,
    error: anyhow::Error,
}

fn run() -> Result<(), ExitError> {
    let args = Args::parse();

    let mut config = ListenerConfig::from_file(&args.config).map_err(|e| ExitError {
        code: EXIT_BAD_CONFIG,
        error: anyhow::Error::new(e).context("loading listener configuration"),
    })?;

    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(protocol) = args.protocol {
        config.protocol = match protocol {
            CliProtocol::Smq => Protocol::Smq,
            CliProtocol::Mqtt => Protocol::Mqtt,
        };
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate().map_err(|e| ExitError {
        code: EXIT_BAD_CONFIG,
        error: anyhow::Error::new(e).context("validating listener configuration"),
    })?;

    let broker = Broker::open(config).map_err(|e| match e {
        BrokerError::Storage(e) => ExitError {
            code: EXIT_STORAGE_ERROR,
            error: anyhow::Error::new(e).context("opening storage"),
        },
        other => ExitError {
            code: EXIT_BAD_CONFIG,
            error: anyhow::Error::new(other),
        },
    })?;

    tracing::info!(bind = %broker.config().bind, protocol = ?broker.config().protocol, "starting listener");

    let (listener, tcp) = smq::broker::listener::Listener::bind(Arc::clone(&broker)).map_err(|e| ExitError {
        code: EXIT_BIND_FAILURE,
        error: anyhow::Error::new(e).context("binding listener socket"),
    })?;

    install_shutdown_handler(broker.clone());

    listener.serve(tcp);
    broker.shutdown();
    Ok(())
}

/// On Ctrl-C, stop draining new connections and let `Broker::shutdown`'s
/// drain deadline finish the rest before the process exits clean.
fn install_shutdown_handler(broker: Arc<Broker>) {
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal, draining connections");
        broker.shutdown();
        std::process::exit(EXIT_CLEAN);
    }) {
        tracing::warn!(error = %e, "failed to install signal handler");
    }
}
