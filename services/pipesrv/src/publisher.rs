//! Normalized record publisher.
//!
//! Every record goes to the durable `mon.device` exchange under
//! `{env}.mon.device.packet.create.{uid}`. Two policy rules run before a
//! publish: uid validity, and the in-batch de-duplication that drops a
//! record arriving within 10 seconds of the previous one for the same
//! device. On unrecoverable publish errors the raw packet bytes spill to
//! disk for offline replay.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, error, info};
use trackwire::record::ImageRecord;
use trackwire::TelemetryRecord;

use crate::broker::{Broker, KEY_PACKET_CREATE};
use crate::error::Result;
use crate::spill::SpillStore;

/// Records closer together than this are considered a spike and dropped
const DEDUP_WINDOW_SECS: i64 = 10;

fn uid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w-]+$").expect("static pattern"))
}

/// Which records of a batch survive the pre-publish policy rules.
pub fn filter_batch(records: Vec<TelemetryRecord>) -> Vec<TelemetryRecord> {
    let mut last_time: HashMap<String, i64> = HashMap::new();
    let mut kept = Vec::with_capacity(records.len());
    for record in records {
        if record.uid.is_empty() || !uid_re().is_match(&record.uid) {
            error!("record dropped: invalid uid {:?}", record.uid);
            continue;
        }
        let epoch = record.epoch_seconds();
        if let Some(previous) = last_time.get(&record.uid) {
            // spike nail: two records inside the window are one event
            if (epoch - previous).abs() < DEDUP_WINDOW_SECS {
                debug!(uid = %record.uid, "record dropped by the 10s de-duplication window");
                continue;
            }
        }
        last_time.insert(record.uid.clone(), epoch);
        kept.push(record);
    }
    kept
}

/// Publishes record batches, spilling raw bytes on failure.
#[derive(Clone)]
pub struct Publisher {
    broker: Broker,
    spill: SpillStore,
}

impl Publisher {
    pub fn new(broker: Broker, spill: SpillStore) -> Self {
        Self { broker, spill }
    }

    /// Publish a batch of records for one device. `raw` is the wire bytes
    /// that produced the batch (head-prefixed where the protocol needs it)
    /// and is what lands in the spill store when the broker is down.
    pub async fn publish(&self, records: Vec<TelemetryRecord>, raw: &[u8]) -> Result<()> {
        let records = filter_batch(records);
        for record in &records {
            let key = format!("{KEY_PACKET_CREATE}.{}", record.uid);
            if let Err(e) = self.broker.publish_json(&key, record).await {
                error!(uid = %record.uid, "publish failed, spilling packet: {e}");
                self.spill.save(&record.uid, raw)?;
                return Err(e);
            }
            info!(uid = %record.uid, time = %record.time, "record published");
        }
        Ok(())
    }

    /// Publish a completed image transfer.
    pub async fn publish_image(&self, image: &ImageRecord) -> Result<()> {
        let key = format!("{KEY_PACKET_CREATE}.{}", image.uid);
        self.broker.publish_json(&key, image).await?;
        info!(uid = %image.uid, "image published");
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::session::RecordSink for Publisher {
    async fn publish(&self, records: Vec<TelemetryRecord>, raw: &[u8]) -> Result<()> {
        Publisher::publish(self, records, raw).await
    }

    async fn publish_image(&self, image: &ImageRecord) -> Result<()> {
        Publisher::publish_image(self, image).await
    }
}
