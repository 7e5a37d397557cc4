//! Autolink binary codec.
//!
//! Head frame: `0xFF <protocol version>` followed by the IMEI as a 64-bit
//! little-endian integer; acknowledged with `0x00 0x00`. Data frame:
//! `0x5B <sequence>` followed by a stream of sub-packets, acknowledged
//! with `0x7B 0x00 <sequence> 0x7D`.
//!
//! Sub-packet: type byte, 16-bit TLV-area length, 32-bit epoch timestamp,
//! TLVs of one tag byte plus a 32-bit value, and a one-byte sum-mod-256
//! checksum over the timestamp and TLV bytes.

use chrono::DateTime;
use tracing::warn;

use crate::codec::{Codec, CodecConfig, DataPayload, Packet, PacketKind, ParseOutput};
use crate::command::{CommandData, DeviceCommand, InitiationConfig, SmsPart, ALIAS_CUSTOM};
use crate::error::{CodecError, Result};
use crate::frame::ByteReader;
use crate::record::TelemetryRecord;

const PREFIX_HEAD: u8 = 0xFF;
const PREFIX_DATA: u8 = 0x5B;

const ACK_HEAD: [u8; 2] = [0x00, 0x00];

const TLV_VOLTAGES: u8 = 1;
const TLV_IBUTTON: u8 = 2;
const TLV_LATITUDE: u8 = 3;
const TLV_LONGITUDE: u8 = 4;
const TLV_MOTION: u8 = 5;
const TLV_STATUS: u8 = 9;

/// Decoded data frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    pub sequence: u8,
    pub records: Vec<TelemetryRecord>,
}

#[derive(Debug)]
pub struct AutolinkCodec;

impl AutolinkCodec {
    pub fn new(_config: &CodecConfig) -> Self {
        Self
    }

    fn parse_one(&self, buf: &[u8]) -> Result<(Packet, usize)> {
        let mut r = ByteReader::new(buf);
        let prefix = r.read_u8()?;
        match prefix {
            PREFIX_HEAD => {
                let _protocol_version = r.read_u8()?;
                let imei = r.read_u64_le()?;
                let total = r.position();
                Ok((
                    Packet::with_ack(
                        PacketKind::Login { uid: imei.to_string() },
                        buf[..total].to_vec(),
                        ACK_HEAD.to_vec(),
                    ),
                    total,
                ))
            }
            PREFIX_DATA => {
                let sequence = r.read_u8()?;
                let mut records = Vec::new();
                // sub-packets run until the buffer ends or the next frame
                // prefix starts
                loop {
                    let rest = r.rest();
                    if rest.is_empty()
                        || rest[0] == PREFIX_HEAD
                        || (rest[0] == PREFIX_DATA && !records.is_empty())
                    {
                        break;
                    }
                    records.push(parse_sub_packet(&mut r)?);
                }
                if records.is_empty() {
                    return Err(CodecError::Truncated { needed: 8 });
                }
                let total = r.position();
                let ack = vec![0x7B, 0x00, sequence, 0x7D];
                Ok((
                    Packet::with_ack(
                        PacketKind::Data(DataPayload::Autolink(DataBlock { sequence, records })),
                        buf[..total].to_vec(),
                        ack,
                    ),
                    total,
                ))
            }
            other => Err(CodecError::framing(format!("unknown packet prefix {other:#04x}"))),
        }
    }
}

fn parse_sub_packet(r: &mut ByteReader<'_>) -> Result<TelemetryRecord> {
    let _kind = r.read_u8()?;
    let tlv_len = r.read_u16_le()? as usize;
    if tlv_len % 5 != 0 {
        return Err(CodecError::framing(format!("TLV area of {tlv_len} bytes")));
    }
    let timestamp_bytes = r.take(4)?;
    let timestamp = u32::from_le_bytes([
        timestamp_bytes[0],
        timestamp_bytes[1],
        timestamp_bytes[2],
        timestamp_bytes[3],
    ]);
    let tlv_area = r.take(tlv_len)?;
    let checksum = r.read_u8()?;
    let computed = timestamp_bytes
        .iter()
        .chain(tlv_area.iter())
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    if checksum != computed {
        return Err(CodecError::Checksum {
            got: u16::from(checksum),
            computed: u16::from(computed),
        });
    }

    let time = DateTime::from_timestamp(i64::from(timestamp), 0)
        .map(|t| t.naive_utc())
        .ok_or_else(|| CodecError::decode(format!("bad timestamp {timestamp}")))?;
    let mut record = TelemetryRecord::at(time);

    let mut tlvs = ByteReader::new(tlv_area);
    while !tlvs.is_empty() {
        let tag = tlvs.read_u8()?;
        match tag {
            TLV_VOLTAGES => {
                let value = tlvs.read_u32_le()?;
                record.set_sensor("ext_battery_voltage", i64::from(value & 0xFFFF));
                record.set_sensor("int_battery_voltage", i64::from(value >> 16));
            }
            TLV_IBUTTON => {
                let value = tlvs.read_u32_le()?;
                record.set_sensor("ibutton", i64::from(value));
            }
            TLV_LATITUDE => record.latitude = Some(f64::from(tlvs.read_f32_le()?)),
            TLV_LONGITUDE => record.longitude = Some(f64::from(tlvs.read_f32_le()?)),
            TLV_MOTION => {
                let packed = tlvs.read_u32_le()?;
                let [speed, sats, altitude, azimuth] = packed.to_le_bytes();
                record.speed = Some(f64::from(speed) * 1.852);
                record.satellites = Some(u32::from(sats));
                record.altitude = Some(f64::from(altitude) * 10.0);
                record.azimuth = Some(f64::from(azimuth) * 2.0);
            }
            TLV_STATUS => {
                let status = u64::from(tlvs.read_u32_le()?);
                for idx in 0..4 {
                    record.set_sensor(&format!("din{idx}"), crate::bits::bit_value(status, idx));
                }
                record.set_sensor("moving", crate::bits::bit_value(status, 4));
                record.set_sensor("acc", crate::bits::bit_value(status, 5));
                record.set_sensor("armed", crate::bits::bit_value(status, 6));
                record.set_sensor("sos", crate::bits::bit_value(status, 7));
                for idx in 0..4 {
                    record.set_sensor(
                        &format!("dout{idx}"),
                        crate::bits::bit_value(status, 8 + idx),
                    );
                }
            }
            other => {
                // unrecognized tag: skip its value, keep the rest
                let _ = tlvs.read_u32_le()?;
                warn!("autolink: ignoring unknown TLV tag {other}");
            }
        }
    }
    record.mirror_position_into_sensors();
    Ok(record)
}

impl Codec for AutolinkCodec {
    fn alias(&self) -> &'static str {
        "autolink"
    }

    fn parse_packets(&mut self, buf: &[u8]) -> ParseOutput {
        let mut packets = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            match self.parse_one(&buf[offset..]) {
                Ok((packet, consumed)) => {
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
                    warn!("autolink frame dropped: {err}");
                    return ParseOutput { packets, rest: Vec::new() };
                }
            }
        }
        ParseOutput { packets, rest: Vec::new() }
    }

    fn translate(&self, packet: &Packet) -> Result<Vec<TelemetryRecord>> {
        match &packet.kind {
            PacketKind::Data(DataPayload::Autolink(block)) => Ok(block.records.clone()),
            _ => Ok(Vec::new()),
        }
    }

    fn encode_command(&self, command: &DeviceCommand) -> Result<CommandData> {
        match command.alias.as_str() {
            ALIAS_CUSTOM => {
                let message = command
                    .param_str("message")
                    .ok_or_else(|| CodecError::decode("custom command without message"))?;
                Ok(CommandData::Tcp(message.as_bytes().to_vec()))
            }
            other => Err(CodecError::UnsupportedCommand(other.to_string())),
        }
    }

    fn initiation_data(&self, _config: &InitiationConfig) -> Result<Vec<SmsPart>> {
        Err(CodecError::UnsupportedCommand("configure".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD_PACKET: &[u8] = b"\xff\x22\xf3\x0c\x45\xf5\xc9\x0f\x03\x00";

    fn sub_packet(timestamp: u32, tlvs: &[(u8, u32)]) -> Vec<u8> {
        let mut area = Vec::new();
        for (tag, value) in tlvs {
            area.push(*tag);
            area.extend_from_slice(&value.to_le_bytes());
        }
        let mut out = vec![0x01];
        out.extend_from_slice(&(area.len() as u16).to_le_bytes());
        let ts = timestamp.to_le_bytes();
        out.extend_from_slice(&ts);
        out.extend_from_slice(&area);
        let checksum = ts.iter().chain(area.iter()).fold(0u8, |a, &b| a.wrapping_add(b));
        out.push(checksum);
        out
    }

    #[test]
    fn test_head_packet() {
        let mut codec = AutolinkCodec::new(&CodecConfig::default());
        let out = codec.parse_packets(HEAD_PACKET);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(
            out.packets[0].kind,
            PacketKind::Login { uid: "861785007918323".into() }
        );
        assert_eq!(codec.ack(&out.packets[0]).unwrap(), vec![0x00, 0x00]);
    }

    #[test]
    fn test_data_packet() {
        let mut codec = AutolinkCodec::new(&CodecConfig::default());
        let lat = 55.78866f32.to_bits();
        let lon = 37.660096f32.to_bits();
        // speed 10 kn, 7 sats, 16*10 m, azimuth 45*2 deg
        let motion = u32::from_le_bytes([10, 7, 16, 45]);
        let mut frame = vec![PREFIX_DATA, 0x07];
        frame.extend_from_slice(&sub_packet(
            1_368_441_581,
            &[
                (TLV_LATITUDE, lat),
                (TLV_LONGITUDE, lon),
                (TLV_MOTION, motion),
                (TLV_VOLTAGES, (3700u32 << 16) | 12500),
                (TLV_STATUS, 0b0011_0001),
            ],
        ));
        let out = codec.parse_packets(&frame);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(codec.ack(&out.packets[0]).unwrap(), vec![0x7B, 0x00, 0x07, 0x7D]);

        let records = codec.translate(&out.packets[0]).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert!((r.latitude.unwrap() - 55.78866).abs() < 1e-4);
        assert!((r.longitude.unwrap() - 37.660096).abs() < 1e-4);
        assert!((r.speed.unwrap() - 18.52).abs() < 1e-9);
        assert_eq!(r.satellites, Some(7));
        assert_eq!(r.altitude, Some(160.0));
        assert_eq!(r.azimuth, Some(90.0));
        assert_eq!(
            r.sensor("ext_battery_voltage"),
            Some(&crate::record::SensorValue::Int(12500))
        );
        assert_eq!(
            r.sensor("int_battery_voltage"),
            Some(&crate::record::SensorValue::Int(3700))
        );
        assert_eq!(r.sensor("din0"), Some(&crate::record::SensorValue::Int(1)));
        assert_eq!(r.sensor("moving"), Some(&crate::record::SensorValue::Int(1)));
        assert_eq!(r.sensor("acc"), Some(&crate::record::SensorValue::Int(1)));
        assert_eq!(r.sensor("sos"), Some(&crate::record::SensorValue::Int(0)));
    }

    #[test]
    fn test_corrupt_sub_packet_checksum() {
        let mut codec = AutolinkCodec::new(&CodecConfig::default());
        let mut frame = vec![PREFIX_DATA, 0x01];
        let mut sub = sub_packet(1_368_441_581, &[(TLV_IBUTTON, 42)]);
        let last = sub.len() - 1;
        sub[last] ^= 0xFF;
        frame.extend_from_slice(&sub);
        let out = codec.parse_packets(&frame);
        assert!(out.packets.is_empty());
        assert!(out.rest.is_empty());
    }

    #[test]
    fn test_head_then_data_reframed() {
        let mut codec = AutolinkCodec::new(&CodecConfig::default());
        let mut buffer = HEAD_PACKET.to_vec();
        buffer.extend_from_slice(&[PREFIX_DATA, 0x02]);
        buffer.extend_from_slice(&sub_packet(1_368_441_581, &[(TLV_IBUTTON, 42)]));
        let out = codec.parse_packets(&buffer);
        assert_eq!(out.packets.len(), 2);
    }

    #[test]
    fn test_partial_head_kept() {
        let mut codec = AutolinkCodec::new(&CodecConfig::default());
        let out = codec.parse_packets(&HEAD_PACKET[..4]);
        assert!(out.packets.is_empty());
        assert_eq!(out.rest, &HEAD_PACKET[..4]);
    }
}
