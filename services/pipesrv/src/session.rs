//! Per-device session handler.
//!
//! Owns one socket. Carries the unparsed tail between reads, learns the
//! device uid from the head/login packet, caches the head bytes so a later
//! spill can prepend them, reassembles camera images, and interleaves
//! broker commands with the acknowledgement traffic.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use trackwire::codec::{Codec, ImageEvent, Packet, PacketKind};
use trackwire::command::{CommandData, DeviceCommand};
use trackwire::record::{ImagePart, ImageRecord, TelemetryRecord};

use crate::broker::{COMMAND_STATUS_ERROR, COMMAND_STATUS_SUCCESS};
use crate::error::Result;
use crate::store::SettingsStore;

/// Reassembly is discarded when no chunk arrived for this long
const IMAGE_CHUNK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Where session output goes: the broker publisher in production, a
/// collector in tests.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn publish(&self, records: Vec<TelemetryRecord>, raw: &[u8]) -> Result<()>;
    async fn publish_image(&self, image: &ImageRecord) -> Result<()>;
}

/// Where session commands come from.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Next pending command for a device, already removed from its queue.
    async fn next_command(&self, uid: &str) -> Result<Option<DeviceCommand>>;
    /// Report command execution status.
    async fn report(&self, guid: &str, status: u8, data: &str) -> Result<()>;
}

/// Session tuning taken from the gateway configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub socket_timeout: Duration,
    pub packet_length: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(60),
            packet_length: 4096,
        }
    }
}

/// Camera image reassembly state.
#[derive(Debug, Default)]
struct ImageAssembly {
    announced: Option<usize>,
    chunks: BTreeMap<u16, Vec<u8>>,
    stream: Vec<u8>,
    received: usize,
    last_chunk: Option<Instant>,
}

impl ImageAssembly {
    fn stale(&self) -> bool {
        self.last_chunk
            .is_some_and(|at| at.elapsed() > IMAGE_CHUNK_TIMEOUT)
    }

    fn apply(&mut self, event: &ImageEvent) {
        if self.stale() {
            debug!("image reassembly timed out, starting over");
            *self = Self::default();
        }
        match event {
            ImageEvent::Announce { size } => {
                *self = Self::default();
                self.announced = Some(*size);
            }
            ImageEvent::Chunk { index, data } => {
                if !data.is_empty() {
                    self.received += data.len();
                    self.chunks.insert(*index, data.clone());
                }
            }
            ImageEvent::Stream { data } => self.stream.extend_from_slice(data),
            ImageEvent::CameraStatus { .. } => {}
        }
        self.last_chunk = Some(Instant::now());
    }

    fn complete(&self) -> bool {
        if let Some(size) = self.announced {
            return self.received >= size;
        }
        // unindexed stream: done at the jpeg end-of-image marker
        self.stream.ends_with(&[0xFF, 0xD9])
    }

    fn assemble(&self) -> Vec<u8> {
        if self.announced.is_some() {
            let mut image = Vec::with_capacity(self.received);
            for chunk in self.chunks.values() {
                image.extend_from_slice(chunk);
            }
            image
        } else {
            self.stream.clone()
        }
    }
}

/// One device connection.
pub struct Session<S> {
    stream: S,
    codec: Box<dyn Codec>,
    sink: Arc<dyn RecordSink>,
    commands: Arc<dyn CommandSource>,
    settings: Option<SettingsStore>,
    options: SessionOptions,
    handler_id: String,
    uid: Option<String>,
    head_raw: Vec<u8>,
    buffer: Vec<u8>,
    image: ImageAssembly,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(
        stream: S,
        codec: Box<dyn Codec>,
        sink: Arc<dyn RecordSink>,
        commands: Arc<dyn CommandSource>,
        settings: Option<SettingsStore>,
        options: SessionOptions,
    ) -> Self {
        let handler_id = format!("{:08x}", rand::random::<u32>());
        Self {
            stream,
            codec,
            sink,
            commands,
            settings,
            options,
            handler_id,
            uid: None,
            head_raw: Vec::new(),
            buffer: Vec::new(),
            image: ImageAssembly::default(),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Drive the session until the peer goes away or the read times out.
    pub async fn run(&mut self) {
        let mut chunk = vec![0u8; self.options.packet_length];
        loop {
            let read = timeout(self.options.socket_timeout, self.stream.read(&mut chunk)).await;
            let n = match read {
                Err(_) => {
                    debug!("[{}] read timeout, closing session", self.handler_id);
                    break;
                }
                Ok(Err(e)) => {
                    debug!("[{}] read error: {e}", self.handler_id);
                    break;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
            };
            if let Err(e) = self.process(&chunk[..n]).await {
                error!("[{}] session error: {e}", self.handler_id);
                break;
            }
        }
        debug!("[{}] session finished (uid: {:?})", self.handler_id, self.uid);
    }

    /// Feed one read's worth of bytes through the codec.
    pub async fn process(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        let input = std::mem::take(&mut self.buffer);
        let output = self.codec.parse_packets(&input);
        self.buffer = output.rest;
        for packet in output.packets {
            self.handle_packet(packet).await?;
        }
        if self.uid.is_some() {
            self.process_commands().await;
        }
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        if let Some(uid) = packet.uid() {
            if self.uid.as_deref() != Some(uid) {
                info!("[{}] device identified: {uid}", self.handler_id);
                self.uid = Some(uid.to_string());
            }
        }
        if matches!(packet.kind, PacketKind::Login { .. }) {
            // some protocols need the head frame to reinterpret the data
            // frames replayed from the spill store
            self.head_raw = packet.raw.clone();
        }

        if let Some(ack) = self.codec.ack(&packet) {
            self.stream.write_all(&ack).await?;
            debug!("[{}] ack sent ({} bytes)", self.handler_id, ack.len());
        }

        match &packet.kind {
            PacketKind::Login { uid } => {
                // provisioning callback: a configuration frame may be
                // waiting in the settings cache for this device
                if let Some(settings) = &self.settings {
                    if let Ok(Some(frame)) = settings.config_frame(uid).await {
                        info!("[{}] sending stored configuration frame", self.handler_id);
                        self.stream.write_all(&frame).await?;
                        settings.delete(uid).await.ok();
                    }
                }
            }
            PacketKind::Data(_) => {
                let mut records = self.codec.translate(&packet)?;
                for record in &mut records {
                    if record.uid.is_empty() {
                        match &self.uid {
                            Some(uid) => record.uid = uid.clone(),
                            None => warn!("[{}] record before login, dropping", self.handler_id),
                        }
                    } else if self.uid.as_ref() != Some(&record.uid) {
                        self.uid = Some(record.uid.clone());
                    }
                }
                records.retain(|r| !r.uid.is_empty());
                if !records.is_empty() {
                    let mut raw = self.head_raw.clone();
                    raw.extend_from_slice(&packet.raw);
                    // publish failures spill inside the sink; the session
                    // keeps reading
                    if let Err(e) = self.sink.publish(records, &raw).await {
                        warn!("[{}] publish failed: {e}", self.handler_id);
                    }
                }
            }
            PacketKind::Settings { uid, status, data } => {
                if let Some(settings) = &self.settings {
                    settings.add_settings(uid, data).await?;
                    debug!("[{}] settings chunk stored, status {status}", self.handler_id);
                    if *status == 2 {
                        settings.finish_reading(uid).await?;
                    }
                }
            }
            PacketKind::CommandAnswer { text } => {
                info!("[{}] command answer: {text}", self.handler_id);
            }
            PacketKind::Image(event) => {
                self.image.apply(event);
                if self.image.complete() {
                    self.finish_image().await?;
                }
            }
            PacketKind::KeepAlive => {}
        }
        Ok(())
    }

    async fn finish_image(&mut self) -> Result<()> {
        let Some(uid) = self.uid.clone() else {
            warn!("[{}] image completed before login, dropped", self.handler_id);
            self.image = ImageAssembly::default();
            return Ok(());
        };
        let bytes = self.image.assemble();
        info!("[{}] image transfer complete ({} bytes)", self.handler_id, bytes.len());
        let image = ImageRecord {
            uid,
            time: chrono::Utc::now().naive_utc(),
            images: vec![ImagePart {
                mime: "image/jpeg".to_string(),
                content: BASE64.encode(&bytes),
            }],
        };
        self.sink.publish_image(&image).await?;
        self.image = ImageAssembly::default();
        Ok(())
    }

    /// Deliver at most one pending broker command over the live link.
    async fn process_commands(&mut self) {
        let Some(uid) = self.uid.clone() else { return };
        let command = match self.commands.next_command(&uid).await {
            Ok(Some(command)) => command,
            Ok(None) => return,
            Err(e) => {
                debug!("[{}] command check failed: {e}", self.handler_id);
                return;
            }
        };
        debug!("[{}] processing command {}", self.handler_id, command.alias);
        match self.codec.encode_command(&command) {
            Ok(CommandData::Tcp(bytes)) => match self.stream.write_all(&bytes).await {
                Ok(()) => {
                    info!("[{}] command {} sent", self.handler_id, command.alias);
                    self.report(&command.guid, COMMAND_STATUS_SUCCESS, "Command data is sent")
                        .await;
                }
                Err(e) => {
                    self.report(&command.guid, COMMAND_STATUS_ERROR, &e.to_string())
                        .await;
                }
            },
            Ok(CommandData::Sms(_)) => {
                // SMS parts belong to the out-of-band dispatcher path
                self.report(
                    &command.guid,
                    COMMAND_STATUS_ERROR,
                    "sms transport not available on a live session",
                )
                .await;
            }
            Err(e) => {
                error!("[{}] command encode failed: {e}", self.handler_id);
                self.report(&command.guid, COMMAND_STATUS_ERROR, &e.to_string())
                    .await;
            }
        }
    }

    async fn report(&self, guid: &str, status: u8, data: &str) {
        if let Err(e) = self.commands.report(guid, status, data).await {
            error!("[{}] command update failed: {e}", self.handler_id);
        }
    }
}
