//! Server-to-device command model.
//!
//! Commands arrive from the broker as JSON; the codec turns them into raw
//! TCP bytes or a list of SMS parts, depending on the requested transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Known command aliases. The set is closed; each codec decides which of
/// them it can encode.
pub const ALIAS_CONFIGURE: &str = "configure";
pub const ALIAS_CUSTOM: &str = "custom";
pub const ALIAS_ACTIVATE_OUTPUT: &str = "activate_digital_output";
pub const ALIAS_DEACTIVATE_OUTPUT: &str = "deactivate_digital_output";
pub const ALIAS_RESTART: &str = "restart_tracker";

/// Delivery transport requested for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Sms,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Tcp
    }
}

/// A command as delivered on `mon.device.command.{uid}` /
/// `mon.device.command.{alias}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub guid: String,
    #[serde(default)]
    pub uid: String,
    #[serde(rename = "command")]
    pub alias: String,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub params: Value,
    /// Initiation config for first-contact provisioning commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl DeviceCommand {
    /// Integer parameter lookup with a default, tolerant of string-typed
    /// JSON numbers the way broker producers send them.
    pub fn param_i64(&self, name: &str, default: i64) -> i64 {
        match self.params.get(name) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }
}

/// One SMS message of a multi-part command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsPart {
    pub message: String,
    /// True when `message` is a hex-encoded binary SMS
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bin: bool,
    /// True for WDP push SMS (Teltonika provisioning)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub push: bool,
}

impl SmsPart {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            bin: false,
            push: false,
        }
    }
}

/// Encoded command, ready for its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandData {
    Tcp(Vec<u8>),
    Sms(Vec<SmsPart>),
}

/// First-contact provisioning parameters, shared by `configure` commands
/// and the per-alias SMS path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitiationConfig {
    /// Device identifier (IMEI or equivalent)
    pub identifier: String,
    /// Gateway host the device must call back
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub gprs: GprsConfig,
    #[serde(default)]
    pub device: DeviceCredentials,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GprsConfig {
    #[serde(default)]
    pub apn: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceCredentials {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
}

impl InitiationConfig {
    /// Build from the `config` object attached to a broker command.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
