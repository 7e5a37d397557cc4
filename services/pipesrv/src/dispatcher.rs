//! Broker command dispatcher.
//!
//! Two entry points. Live sessions poll `{env}.mon.device.command.{uid}`
//! between reads and push the first pending command down the TCP link.
//! A long-lived task consumes `{env}.mon.device.command.{alias}`
//! irrespective of any session and synthesizes SMS payloads for
//! first-contact provisioning, forwarding them to the `n.work` exchange.
//! Both paths report `{guid, status, data}` on `mon.device.command.update`.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trackwire::command::{CommandData, DeviceCommand, InitiationConfig, SmsPart, Transport};
use trackwire::{CodecConfig, Registry};

use crate::broker::{
    Broker, COMMAND_STATUS_ERROR, COMMAND_STATUS_SUCCESS, EXCHANGE_DEVICE, EXCHANGE_WORK,
    KEY_COMMAND, KEY_WORK_PROCESS,
};
use crate::config::PipeConfig;
use crate::error::Result;
use crate::session::CommandSource;

/// Backoff after a broker connection exception
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(60);

/// Per-uid command source backed by the broker; used by live sessions.
#[derive(Clone)]
pub struct BrokerCommands {
    broker: Broker,
}

impl BrokerCommands {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl CommandSource for BrokerCommands {
    async fn next_command(&self, uid: &str) -> Result<Option<DeviceCommand>> {
        let suffix = format!("{KEY_COMMAND}.{uid}");
        let queue = self.broker.routing_key(&suffix);
        self.broker.declare_queue(&queue, &queue, EXCHANGE_DEVICE).await?;
        let Some(delivery) = self.broker.get(&queue).await? else {
            return Ok(None);
        };
        // the command is in-process from here on; a failed execution is
        // reported on the update topic, not redelivered
        self.broker.ack(&delivery).await?;
        let command: DeviceCommand = serde_json::from_slice(&delivery.data)?;
        debug!(uid, alias = %command.alias, "command fetched");
        Ok(Some(command))
    }

    async fn report(&self, guid: &str, status: u8, data: &str) -> Result<()> {
        self.broker.command_update(guid, status, data).await
    }
}

/// SMS work item published to `n.work.work.process`.
fn sms_work_item(part: &SmsPart, command: &DeviceCommand) -> serde_json::Value {
    let mut item = json!({
        "type": "sms",
        "message": part.message,
        "remaining": 1,
    });
    if part.bin {
        item["bin"] = json!(true);
    }
    if part.push {
        item["push"] = json!(true);
    }
    if let Some(config) = &command.config {
        for (source, target) in [
            ("address", "send_to"),
            ("callback", "callback"),
            ("id_object", "id_object"),
            ("id_firm", "id_firm"),
        ] {
            if let Some(value) = config.get(source) {
                item[target] = value.clone();
            }
        }
        if let Some(from) = config.get("from") {
            item["params"] = json!({ "from": from });
        }
    }
    item
}

/// Encode one out-of-band command and forward its SMS parts.
async fn process_alias_command(
    broker: &Broker,
    config: &PipeConfig,
    command: &DeviceCommand,
) -> Result<()> {
    let codec = Registry::standard().create(
        &config.handler,
        &CodecConfig {
            settings: config.settings.clone(),
        },
    )?;

    let parts = match command.transport {
        Transport::Sms => match codec.encode_command(command)? {
            CommandData::Sms(parts) => parts,
            CommandData::Tcp(_) => {
                // initiation data is the SMS rendition of `configure`
                let init = command
                    .config
                    .as_ref()
                    .and_then(InitiationConfig::from_value)
                    .ok_or_else(|| {
                        crate::error::PipeError::Data("sms command without config".into())
                    })?;
                codec.initiation_data(&init)?
            }
        },
        Transport::Tcp => {
            return Err(crate::error::PipeError::Data(
                "tcp command on the protocol-alias queue".into(),
            ));
        }
    };

    for part in &parts {
        let item = sms_work_item(part, command);
        broker
            .publish_to(EXCHANGE_WORK, KEY_WORK_PROCESS, &serde_json::to_vec(&item)?)
            .await?;
        debug!("sms part forwarded to the work exchange");
    }
    Ok(())
}

/// Long-lived consumer of `{env}.mon.device.command.{alias}`, with
/// reconnect backoff. The alias is the protocol family of the configured
/// handler.
pub async fn run_alias_listener(config: PipeConfig, shutdown: CancellationToken) {
    let alias = config
        .handler
        .split('.')
        .next()
        .unwrap_or(&config.handler)
        .to_string();
    while !shutdown.is_cancelled() {
        let attempt = async {
            let broker = Broker::connect(&config.amqp_connection, &config.environment).await?;
            let queue = broker.routing_key(&format!("{KEY_COMMAND}.{alias}"));
            broker.declare_queue(&queue, &queue, EXCHANGE_DEVICE).await?;
            let mut consumer = broker.consume(&queue, &format!("commands-{alias}")).await?;
            info!("command listener attached to {queue}");
            while let Some(delivery) = consumer.next().await {
                let delivery = delivery?;
                match serde_json::from_slice::<DeviceCommand>(&delivery.data) {
                    Ok(command) => {
                        let result = process_alias_command(&broker, &config, &command).await;
                        let (status, data) = match result {
                            Ok(()) => (
                                COMMAND_STATUS_SUCCESS,
                                "Command was successfully received and processed".to_string(),
                            ),
                            Err(e) => (COMMAND_STATUS_ERROR, e.to_string()),
                        };
                        if let Err(e) = broker.command_update(&command.guid, status, &data).await {
                            error!("command update failed: {e}");
                        }
                    }
                    Err(e) => error!("undecodable command dropped: {e}"),
                }
                broker.ack(&delivery).await?;
            }
            Ok::<(), crate::error::PipeError>(())
        };
        tokio::select! {
            result = attempt => {
                if let Err(e) = result {
                    error!("[{alias}] command listener error: {e}");
                }
            }
            () = shutdown.cancelled() => return,
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sms_work_item_shape() {
        let command: DeviceCommand = serde_json::from_value(json!({
            "guid": "g1",
            "uid": "",
            "command": "configure",
            "transport": "sms",
            "params": {},
            "config": {
                "identifier": "357073060065189",
                "host": "trx.example.net",
                "port": 21200,
                "address": "+79991234567"
            }
        }))
        .unwrap();
        let part = SmsPart {
            message: "0605…".into(),
            bin: true,
            push: true,
        };
        let item = sms_work_item(&part, &command);
        assert_eq!(item["type"], "sms");
        assert_eq!(item["remaining"], 1);
        assert_eq!(item["bin"], true);
        assert_eq!(item["push"], true);
        assert_eq!(item["send_to"], "+79991234567");
    }

    #[test]
    fn test_plain_text_part_has_no_bin_flag() {
        let command: DeviceCommand = serde_json::from_value(json!({
            "guid": "g2", "uid": "", "command": "configure", "transport": "sms", "params": {}
        }))
        .unwrap();
        let item = sms_work_item(&SmsPart::text("COM3 1234,host,21200"), &command);
        assert!(item.get("bin").is_none());
        assert!(item.get("send_to").is_none());
    }
}
