use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    path::PathBuf,
};

use anyhow::{Result, anyhow};
use blocksync::{cfg::Config, sim::Simulation};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Synchronize an in-memory chain from a simulated peer network.
#[derive(Parser, Debug)]
struct Args {
    /// May be repeated. Top-level keys must not be repeated across files.
    #[clap(long, short)]
    config_file: Vec<PathBuf>,
    #[clap(long, default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .with_ansi(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    log_panics();

    let config = load_config(&args.config_file)?;
    config.validate()?;
    info!(
        chain_length = config.simulation.chain_length,
        local_length = config.simulation.local_length,
        peers = config.simulation.peers,
        unreliable_peers = config.simulation.unreliable_peers,
        lying_peers = config.simulation.lying_peers,
        "Simulation : configured"
    );

    let mut simulation = Simulation::new(config.sync, &config.simulation)?;
    let report = tokio::select! {
        report = simulation.run() => report?,
        _ = tokio::signal::ctrl_c() => {
            info!("Simulation : interrupted");
            return Ok(());
        }
    };

    info!(
        synced = report.synced,
        local = report.local_best.number,
        hash = %report.local_best.hash,
        canonical = report.canonical_height,
        elapsed = ?report.elapsed,
        sent = report.messages_sent,
        dropped = report.responses_dropped,
        "Simulation : finished"
    );
    if !report.synced {
        return Err(anyhow!(
            "did not reach block {} within {:?}",
            report.target,
            config.simulation.run_for
        ));
    }
    Ok(())
}

/// Record panics as `tracing` events at the `ERROR` verbosity level, so they reach the same sink as everything else.
fn log_panics() {
    std::panic::set_hook(Box::new(|panic| {
        let payload = panic.payload();
        let message = payload
            .downcast_ref::<&'static str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("Box<dyn Any>");
        let thread = std::thread::current();

        let backtrace = Backtrace::capture();
        let backtrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

        tracing::error!(
            thread_name = thread.name().unwrap_or("<unnamed>"),
            message,
            panic.file = panic.location().map(|l| l.file()),
            panic.line = panic.location().map(|l| l.line()),
            panic.column = panic.location().map(|l| l.column()),
            backtrace = backtrace.as_deref(),
        );
    }));
}

/// Merge the given TOML files. With none, every setting takes its default.
fn load_config(files: &[PathBuf]) -> Result<Config> {
    let mut merged_config = toml::Table::new();
    for config_file in files {
        let config = fs::read_to_string(config_file)?;
        let config: toml::Table = toml::from_str(&config)?;
        for key in config.keys() {
            if merged_config.contains_key(key) {
                return Err(anyhow!(
                    "configuration conflict: {config_file:?} contained a key {key:?} that was already included in an earlier file"
                ));
            }
        }
        merged_config.extend(config);
    }

    Ok(serde::Deserialize::deserialize(merged_config)?)
}
