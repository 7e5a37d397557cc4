//! Packet receive balancer process.
//!
//! Consumes the per-device record queues and enforces at-most-one-in-flight
//! per uid toward `mon.device.packet.receive`.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pipesrv::config::{Args, PipeConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = common::logging::init(&args.logs) {
        eprintln!("logging setup failed: {e}");
        return ExitCode::FAILURE;
    }

    let config = match PipeConfig::load(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("fatal: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("starting pipe-balancer ({})", config.environment);

    let shutdown = CancellationToken::new();
    let balancer_shutdown = shutdown.clone();
    let balancer = tokio::spawn(async move {
        pipesrv::balancer::run(&config, balancer_shutdown).await
    });

    if tokio::signal::ctrl_c().await.is_err() {
        error!("signal handling unavailable");
        return ExitCode::FAILURE;
    }
    info!("shutdown requested");
    shutdown.cancel();

    match balancer.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!("balancer error: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("balancer task panicked: {e}");
            ExitCode::FAILURE
        }
    }
}
