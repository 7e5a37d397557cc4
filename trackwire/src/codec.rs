//! Codec capability trait and the packet envelope shared by all families.
//!
//! A codec owns the per-connection protocol state (e.g. the Teltonika
//! login phase) and exposes the capability set every firmware family
//! implements: framing, translation, acknowledgement and command encoding.

use std::collections::HashMap;

use crate::command::{CommandData, DeviceCommand, InitiationConfig, SmsPart};
use crate::error::Result;
use crate::record::TelemetryRecord;

/// Decoded payload of a data packet. Closed enumeration over the protocol
/// families; `translate` on each codec consumes its own variant.
#[derive(Debug, Clone, PartialEq)]
pub enum DataPayload {
    Globalsat(crate::globalsat::Report),
    Naviset(crate::naviset::DataBlock),
    Teltonika(crate::teltonika::AvlArray),
    Autolink(crate::autolink::DataBlock),
    Atrack(crate::atrack::PositionReport),
    Galileo(crate::galileo::TagList),
    Ime(crate::ime::GprmcReport),
}

/// Image transfer bookkeeping produced while parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageEvent {
    /// The device announced the total image size
    Announce { size: usize },
    /// Indexed chunk (Naviset)
    Chunk { index: u16, data: Vec<u8> },
    /// Unindexed stream chunk, appended in arrival order (Galileo header 4)
    Stream { data: Vec<u8> },
    /// Camera status report
    CameraStatus { code: u8 },
}

/// Semantic kind of a parsed protocol packet.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketKind {
    /// Head/login frame carrying the device identifier
    Login { uid: String },
    /// Telemetry payload; records come out of `Codec::translate`
    Data(DataPayload),
    /// Answer to a previously issued command
    CommandAnswer { text: String },
    /// Image transfer event
    Image(ImageEvent),
    /// Device settings line (Globalsat `GSs`); `status == 2` ends the read
    Settings { uid: String, status: u8, data: String },
    /// Keep-alive frame, echoed by the ack
    KeepAlive,
}

/// A parsed protocol packet: semantic kind plus the raw frame bytes (kept
/// for spill-on-failure) and the precomputed acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub raw: Vec<u8>,
    pub(crate) ack: Option<Vec<u8>>,
}

impl Packet {
    pub fn new(kind: PacketKind, raw: Vec<u8>) -> Self {
        Self { kind, raw, ack: None }
    }

    pub fn with_ack(kind: PacketKind, raw: Vec<u8>, ack: Vec<u8>) -> Self {
        Self { kind, raw, ack: Some(ack) }
    }

    /// Uid carried by this packet, if the frame identifies the device.
    pub fn uid(&self) -> Option<&str> {
        match &self.kind {
            PacketKind::Login { uid } => Some(uid),
            PacketKind::Settings { uid, .. } => Some(uid),
            // Galileo devices identify themselves with a tag inside an
            // ordinary data frame
            PacketKind::Data(DataPayload::Galileo(list)) => match list.get(0x03) {
                Some(crate::galileo::tags::TagValue::Text(imei)) => Some(imei.as_str()),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Result of one framing pass over the input buffer.
///
/// `rest` holds the bytes of an incomplete trailing frame; the session
/// prepends them to the next socket read. A corrupt frame drops the
/// remainder of the buffer (empty `rest`) after logging.
#[derive(Debug, Default)]
pub struct ParseOutput {
    pub packets: Vec<Packet>,
    pub rest: Vec<u8>,
}

/// Per-protocol settings from the handler configuration file, e.g. the
/// Globalsat `reportFormat` or the ATrack `customInfo` field list.
#[derive(Debug, Clone, Default)]
pub struct CodecConfig {
    pub settings: HashMap<String, String>,
}

impl CodecConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }
}

/// The capability set every firmware family implements.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Protocol family alias this codec serves
    fn alias(&self) -> &'static str;

    /// Frame the buffer into protocol packets. Checksum verification
    /// happens here, before any semantic decoding; packets that fail it
    /// are discarded without an ack.
    fn parse_packets(&mut self, buf: &[u8]) -> ParseOutput;

    /// Turn a data packet into zero or more normalized records. Records
    /// come back without a uid when the frame does not carry one; the
    /// session fills it from the login packet.
    fn translate(&self, packet: &Packet) -> Result<Vec<TelemetryRecord>>;

    /// Acknowledgement bytes for a packet, if the protocol mandates one.
    fn ack(&self, packet: &Packet) -> Option<Vec<u8>> {
        packet.ack.clone()
    }

    /// Encode a broker command for its transport.
    fn encode_command(&self, command: &DeviceCommand) -> Result<CommandData>;

    /// SMS parts for first-contact provisioning.
    fn initiation_data(&self, config: &InitiationConfig) -> Result<Vec<SmsPart>>;
}
