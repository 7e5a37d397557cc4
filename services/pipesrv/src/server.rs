//! TCP listener: one process, one protocol, one port.
//!
//! Accepts connections until shutdown; every accepted socket becomes an
//! independent session task. Accept failures are logged and the loop
//! continues.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use trackwire::Registry;

use crate::config::PipeConfig;
use crate::error::{PipeError, Result};
use crate::session::{CommandSource, RecordSink, Session, SessionOptions};
use crate::store::SettingsStore;

/// Listener with everything a session needs.
pub struct Server {
    config: PipeConfig,
    registry: Registry,
    sink: Arc<dyn RecordSink>,
    commands: Arc<dyn CommandSource>,
    settings: Option<SettingsStore>,
}

impl Server {
    pub fn new(
        config: PipeConfig,
        sink: Arc<dyn RecordSink>,
        commands: Arc<dyn CommandSource>,
        settings: Option<SettingsStore>,
    ) -> Result<Self> {
        let registry = Registry::standard();
        // fail fast on an unknown handler before binding anything
        registry.create(&config.handler, &config.codec_config())?;
        Ok(Self {
            config,
            registry,
            sink,
            commands,
            settings,
        })
    }

    /// Bind the configured port and accept until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| PipeError::Config(format!("cannot bind {addr}: {e}")))?;
        info!("listening on {addr} for protocol {}", self.config.handler);

        let options = SessionOptions {
            socket_timeout: Duration::from_secs(self.config.socket_timeout),
            packet_length: self.config.socket_packet_length,
        };

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                () = shutdown.cancelled() => {
                    info!("listener shutting down");
                    return Ok(());
                }
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // per-connection faults never stop the accept loop
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            info!("connection from {peer}");

            let codec = match self
                .registry
                .create(&self.config.handler, &self.config.codec_config())
            {
                Ok(codec) => codec,
                Err(e) => {
                    error!("codec construction failed: {e}");
                    continue;
                }
            };
            let mut session = Session::new(
                stream,
                codec,
                Arc::clone(&self.sink),
                Arc::clone(&self.commands),
                self.settings.clone(),
                options.clone(),
            );
            tokio::spawn(async move {
                session.run().await;
            });
        }
    }
}
