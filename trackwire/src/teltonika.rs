//! Teltonika FMxxxx codec.
//!
//! Two-phase link. The first packet after accept is a 2-byte big-endian
//! length plus the ASCII IMEI, acknowledged with a single `0x01`. Every
//! later frame is a zero preamble (u32), a big-endian data length, the AVL
//! data array and a CRC-16 (reflected poly, init 0x0000) carried in four
//! big-endian bytes. The server acks with the number of records it
//! accepted, as a big-endian u32.
//!
//! HDOP is not on the wire; records carry the fabricated value 1.0 the
//! gateway has always reported for this family.

use chrono::DateTime;
use tracing::warn;

use crate::checksum::{crc16, CRC16_INIT_DF1};
use crate::codec::{Codec, CodecConfig, DataPayload, Packet, PacketKind, ParseOutput};
use crate::command::{
    CommandData, DeviceCommand, InitiationConfig, SmsPart, ALIAS_CONFIGURE,
};
use crate::error::{CodecError, Result};
use crate::frame::ByteReader;
use crate::geo;
use crate::record::TelemetryRecord;

/// WDP port the provisioning push SMS is addressed to
const PUSH_SMS_PORT: u16 = 0x07D1;

const ACK_LOGIN: [u8; 1] = [0x01];

/// One IO element entry of an AVL record.
#[derive(Debug, Clone, PartialEq)]
pub struct IoItem {
    pub id: u8,
    pub value: u64,
}

/// One AVL record.
#[derive(Debug, Clone, PartialEq)]
pub struct AvlRecord {
    pub record: TelemetryRecord,
    pub priority: u8,
    pub event_io_id: u8,
    pub io_items: Vec<IoItem>,
}

/// Decoded AVL data array.
#[derive(Debug, Clone, PartialEq)]
pub struct AvlArray {
    pub codec_id: u8,
    pub records: Vec<AvlRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingImei,
    AwaitingData,
}

#[derive(Debug)]
pub struct TeltonikaCodec {
    phase: Phase,
}

impl TeltonikaCodec {
    pub fn new(_config: &CodecConfig) -> Self {
        Self {
            phase: Phase::AwaitingImei,
        }
    }

    fn parse_imei(&self, buf: &[u8]) -> Result<(Packet, usize)> {
        let mut r = ByteReader::new(buf);
        let length = r.read_u16_be()? as usize;
        let imei = std::str::from_utf8(r.take(length)?)
            .map_err(|e| CodecError::decode(format!("bad IMEI: {e}")))?
            .to_string();
        let total = r.position();
        Ok((
            Packet::with_ack(PacketKind::Login { uid: imei }, buf[..total].to_vec(), ACK_LOGIN.to_vec()),
            total,
        ))
    }

    fn parse_data(&self, buf: &[u8]) -> Result<(Packet, usize)> {
        let mut r = ByteReader::new(buf);
        let preamble = r.read_u32_be()?;
        if preamble != 0 {
            return Err(CodecError::framing(format!("bad preamble {preamble:#010x}")));
        }
        let length = r.read_u32_be()? as usize;
        let body = r.take(length)?;
        let crc = r.read_u32_be()?;
        let total = r.position();
        let computed = u32::from(crc16(body, CRC16_INIT_DF1));
        if crc != computed {
            return Err(CodecError::Checksum {
                got: crc as u16,
                computed: computed as u16,
            });
        }
        let array = parse_avl_array(body)?;
        let count = array.records.len() as u32;
        Ok((
            Packet::with_ack(
                PacketKind::Data(DataPayload::Teltonika(array)),
                buf[..total].to_vec(),
                count.to_be_bytes().to_vec(),
            ),
            total,
        ))
    }
}

fn parse_avl_array(body: &[u8]) -> Result<AvlArray> {
    let mut b = ByteReader::new(body);
    let codec_id = b.read_u8()?;
    let count = b.read_u8()?;
    let mut records = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        records.push(parse_avl_record(&mut b)?);
    }
    let trailing = b.read_u8()?;
    if trailing != count {
        return Err(CodecError::framing(format!(
            "AVL record count mismatch: {count} in head, {trailing} in tail"
        )));
    }
    if !b.is_empty() {
        return Err(CodecError::framing("trailing bytes after AVL array"));
    }
    Ok(AvlArray { codec_id, records })
}

fn parse_avl_record(b: &mut ByteReader<'_>) -> Result<AvlRecord> {
    let timestamp_ms = b.read_u64_be()?;
    let time = DateTime::from_timestamp_millis(timestamp_ms as i64)
        .map(|t| t.naive_utc())
        .ok_or_else(|| CodecError::decode(format!("bad timestamp {timestamp_ms}")))?;
    let priority = b.read_u8()?;
    // longitude precedes latitude on the wire
    let longitude = geo::from_decimicrodegrees(b.read_i32_be()?);
    let latitude = geo::from_decimicrodegrees(b.read_i32_be()?);
    let altitude = b.read_u16_be()?;
    let azimuth = b.read_u16_be()?;
    let satellites = b.read_u8()?;
    let speed = b.read_u16_be()?;

    let event_io_id = b.read_u8()?;
    let _total_count = b.read_u8()?;
    let mut io_items = Vec::new();
    for width in [1u8, 2, 4, 8] {
        let count = b.read_u8()?;
        for _ in 0..count {
            let id = b.read_u8()?;
            let value = match width {
                1 => u64::from(b.read_u8()?),
                2 => u64::from(b.read_u16_be()?),
                4 => u64::from(b.read_u32_be()?),
                _ => b.read_u64_be()?,
            };
            io_items.push(IoItem { id, value });
        }
    }

    let mut record = TelemetryRecord::at(time);
    record.longitude = Some(longitude);
    record.latitude = Some(latitude);
    record.altitude = Some(f64::from(altitude));
    record.azimuth = Some(f64::from(azimuth));
    record.satellites = Some(u32::from(satellites));
    record.speed = Some(f64::from(speed));
    record.hdop = Some(1.0);
    record.set_sensor("priority", i64::from(priority));
    if event_io_id != 0 {
        record.set_sensor("event_io_id", i64::from(event_io_id));
    }
    for item in &io_items {
        record.set_sensor(&format!("io{}", item.id), item.value as i64);
    }
    record.mirror_position_into_sensors();

    Ok(AvlRecord {
        record,
        priority,
        event_io_id,
        io_items,
    })
}

fn pack_string(value: &str) -> Vec<u8> {
    let mut out = vec![value.len() as u8];
    out.extend_from_slice(value.as_bytes());
    out
}

/// Push-SMS payload that makes the device call back over TCP: WDP port
/// header, then login, password, host, port and the GPRS triple.
fn initiation_sms_buffer(config: &InitiationConfig) -> Vec<u8> {
    let mut buffer = vec![0x06, 0x05, 0x04];
    buffer.extend_from_slice(&PUSH_SMS_PORT.to_be_bytes());
    buffer.extend_from_slice(&[0x00, 0x00]);
    buffer.extend_from_slice(&pack_string(&config.device.login));
    buffer.extend_from_slice(&pack_string(&config.device.password));
    buffer.extend_from_slice(&pack_string(&config.host));
    buffer.extend_from_slice(&config.port.to_be_bytes());
    buffer.extend_from_slice(&pack_string(&config.gprs.apn));
    buffer.extend_from_slice(&pack_string(&config.gprs.username));
    buffer.extend_from_slice(&pack_string(&config.gprs.password));
    buffer
}

impl Codec for TeltonikaCodec {
    fn alias(&self) -> &'static str {
        "teltonika"
    }

    fn parse_packets(&mut self, buf: &[u8]) -> ParseOutput {
        let mut packets = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            let attempt = match self.phase {
                Phase::AwaitingImei => self.parse_imei(&buf[offset..]),
                Phase::AwaitingData => self.parse_data(&buf[offset..]),
            };
            match attempt {
                Ok((packet, consumed)) => {
                    if matches!(packet.kind, PacketKind::Login { .. }) {
                        self.phase = Phase::AwaitingData;
                    }
                    packets.push(packet);
                    offset += consumed;
                }
                Err(err) if err.is_truncated() => {
                    return ParseOutput {
                        packets,
                        rest: buf[offset..].to_vec(),
                    };
                }
                Err(err) => {
                    warn!("teltonika frame dropped: {err}");
                    return ParseOutput { packets, rest: Vec::new() };
                }
            }
        }
        ParseOutput { packets, rest: Vec::new() }
    }

    fn translate(&self, packet: &Packet) -> Result<Vec<TelemetryRecord>> {
        match &packet.kind {
            PacketKind::Data(DataPayload::Teltonika(array)) => {
                Ok(array.records.iter().map(|r| r.record.clone()).collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn encode_command(&self, command: &DeviceCommand) -> Result<CommandData> {
        match command.alias.as_str() {
            ALIAS_CONFIGURE => {
                let config = command
                    .config
                    .as_ref()
                    .and_then(InitiationConfig::from_value)
                    .ok_or_else(|| CodecError::decode("configure command without config"))?;
                Ok(CommandData::Sms(self.initiation_data(&config)?))
            }
            other => Err(CodecError::UnsupportedCommand(other.to_string())),
        }
    }

    fn initiation_data(&self, config: &InitiationConfig) -> Result<Vec<SmsPart>> {
        Ok(vec![SmsPart {
            message: hex::encode(initiation_sms_buffer(config)),
            bin: true,
            push: true,
        }])
    }
}
