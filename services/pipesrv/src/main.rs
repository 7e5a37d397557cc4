//! Gateway listener process.
//!
//! One process serves one protocol family on one TCP port. Exit code 0 on
//! orderly shutdown, 1 on configuration or startup errors.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pipesrv::broker::Broker;
use pipesrv::config::{Args, PipeConfig};
use pipesrv::dispatcher::{run_alias_listener, BrokerCommands};
use pipesrv::publisher::Publisher;
use pipesrv::server::Server;
use pipesrv::spill::SpillStore;
use pipesrv::store::SettingsStore;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = common::logging::init(&args.logs) {
        eprintln!("logging setup failed: {e}");
        return ExitCode::FAILURE;
    }
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> pipesrv::Result<()> {
    let config = PipeConfig::load(args)?;
    info!(
        "starting pipesrv: handler {} on port {} ({})",
        config.handler, config.port, config.environment
    );

    let broker = Broker::connect(&config.amqp_connection, &config.environment).await?;
    let redis = common::RedisClient::connect(&config.redis.url()).await?;
    let settings = SettingsStore::new(redis);

    let spill = SpillStore::new(config.spill_dir());
    let publisher = Arc::new(Publisher::new(broker.clone(), spill));
    let commands = Arc::new(BrokerCommands::new(broker));

    let shutdown = CancellationToken::new();

    // out-of-band commands for this protocol family (SMS provisioning)
    let alias_task = tokio::spawn(run_alias_listener(config.clone(), shutdown.clone()));

    let server = Server::new(config, publisher, commands, Some(settings))?;
    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move { server.run(server_shutdown).await });

    tokio::signal::ctrl_c().await.map_err(pipesrv::PipeError::Io)?;
    info!("shutdown requested");
    shutdown.cancel();

    if let Ok(Err(e)) = server_task.await {
        error!("listener error during shutdown: {e}");
    }
    let _ = alias_task.await;
    Ok(())
}
