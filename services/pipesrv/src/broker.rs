//! AMQP plumbing shared by the publisher, the balancer and the command
//! dispatcher.
//!
//! One durable topic exchange `mon.device` carries everything device
//! related; `n.work` carries synthesized SMS work items. All routing keys
//! are prefixed with the configured environment.

use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use serde::Serialize;

use crate::error::Result;

/// Device telemetry and command exchange
pub const EXCHANGE_DEVICE: &str = "mon.device";
/// SMS work queue exchange
pub const EXCHANGE_WORK: &str = "n.work";

/// Routing-key suffixes under `{env}.`
pub const KEY_PACKET_CREATE: &str = "mon.device.packet.create";
pub const KEY_PACKET_RECEIVE: &str = "mon.device.packet.receive";
pub const KEY_SIGNAL_REQUEST: &str = "mon.device.packet.signal.request";
pub const KEY_SIGNAL_RESPONSE: &str = "mon.device.packet.signal.response";
pub const KEY_COMMAND: &str = "mon.device.command";
pub const KEY_COMMAND_UPDATE: &str = "mon.device.command.update";
pub const KEY_WORK_PROCESS: &str = "n.work.work.process";

/// Command status values reported on `mon.device.command.update`
pub const COMMAND_STATUS_CREATED: u8 = 1;
pub const COMMAND_STATUS_SUCCESS: u8 = 2;
pub const COMMAND_STATUS_ERROR: u8 = 3;

/// Broker connection with both exchanges declared.
#[derive(Clone)]
pub struct Broker {
    channel: Channel,
    environment: String,
}

impl Broker {
    /// Connect and declare the exchanges.
    pub async fn connect(amqp_url: &str, environment: &str) -> Result<Self> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        for exchange in [EXCHANGE_DEVICE, EXCHANGE_WORK] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(Self {
            channel,
            environment: environment.to_string(),
        })
    }

    /// `{env}.{suffix}` routing key.
    pub fn routing_key(&self, suffix: &str) -> String {
        format!("{}.{}", self.environment, suffix)
    }

    /// Publish a JSON payload to the device exchange.
    pub async fn publish_json<T: Serialize>(&self, routing_suffix: &str, payload: &T) -> Result<()> {
        self.publish_to(EXCHANGE_DEVICE, routing_suffix, &serde_json::to_vec(payload)?)
            .await
    }

    /// Publish raw bytes to an exchange under `{env}.{suffix}`.
    pub async fn publish_to(&self, exchange: &str, routing_suffix: &str, payload: &[u8]) -> Result<()> {
        let routing_key = self.routing_key(routing_suffix);
        // queue-per-routing-key topology: make sure a consumerless publish
        // is not dropped on the floor
        self.declare_queue(&routing_key, &routing_key, exchange).await?;
        self.channel
            .basic_publish(
                exchange,
                &routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await?
            .await?;
        Ok(())
    }

    /// Declare a durable queue bound to the device exchange.
    pub async fn declare_queue(&self, name: &str, routing_key: &str, exchange: &str) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.channel
            .queue_bind(
                name,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Start consuming a queue.
    pub async fn consume(&self, queue: &str, tag: &str) -> Result<Consumer> {
        Ok(self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?)
    }

    /// Fetch a single pending message, if any.
    pub async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?;
        Ok(message.map(|m| m.delivery))
    }

    /// Ack a delivery.
    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        delivery.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

/// Command status report payload.
#[derive(Debug, Serialize)]
pub struct CommandUpdate {
    pub guid: String,
    pub status: u8,
    pub data: String,
}

impl Broker {
    /// Report command execution status on `mon.device.command.update`.
    pub async fn command_update(&self, guid: &str, status: u8, data: &str) -> Result<()> {
        self.publish_json(
            KEY_COMMAND_UPDATE,
            &CommandUpdate {
                guid: guid.to_string(),
                status,
                data: data.to_string(),
            },
        )
        .await
    }
}
