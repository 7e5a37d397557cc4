//! Galileo binary codec.
//!
//! Frame: header byte, 16-bit little-endian length (on tag packets the top
//! bit flags an archive replay), body, CRC-16/Modbus over header+length+
//! body. Header 1 is a tag list; header 4 is a raw jpeg stream chunk of a
//! camera transfer. Every verified frame is acknowledged with
//! `0x02 <crc-le>`.

pub mod tags;

use tracing::warn;

use crate::bits::bit_value;
use crate::checksum::crc16_modbus;
use crate::codec::{Codec, CodecConfig, DataPayload, ImageEvent, Packet, PacketKind, ParseOutput};
use crate::command::{
    CommandData, DeviceCommand, InitiationConfig, SmsPart, ALIAS_CONFIGURE, ALIAS_CUSTOM,
};
use crate::error::{CodecError, Result};
use crate::frame::ByteReader;
use crate::record::TelemetryRecord;

use tags::{tag_width, Tag, TagValue, TagWidth};

const HEADER_TAGS: u8 = 0x01;
const HEADER_IMAGE: u8 = 0x04;

const TAG_IMEI: u8 = 0x03;
const TAG_COMMAND_NUMBER: u8 = 0xE0;
const TAG_COMMAND_TEXT: u8 = 0xE1;

const SMS_PASSWORD: &str = "1234";

/// Parsed tag packet body.
#[derive(Debug, Clone, PartialEq)]
pub struct TagList {
    pub archive: bool,
    pub tags: Vec<Tag>,
}

impl TagList {
    pub fn get(&self, id: u8) -> Option<&TagValue> {
        self.tags.iter().find(|t| t.id == id).map(|t| &t.value)
    }

    pub fn has(&self, id: u8) -> bool {
        self.get(id).is_some()
    }
}

#[derive(Debug)]
pub struct GalileoCodec;

impl GalileoCodec {
    pub fn new(_config: &CodecConfig) -> Self {
        Self
    }

    fn parse_one(&self, buf: &[u8]) -> Result<(Packet, usize)> {
        let mut r = ByteReader::new(buf);
        let header = r.read_u8()?;
        let mut length = r.read_u16_le()? as usize;
        let mut archive = false;
        if header == HEADER_TAGS {
            archive = length & 0x8000 != 0;
            length &= 0x7FFF;
        }
        let body = r.take(length)?;
        let crc = r.read_u16_le()?;
        let total = r.position();
        let computed = crc16_modbus(&buf[..3 + length]);
        crate::frame::verify_checksum(crc, computed)?;

        let raw = buf[..total].to_vec();
        let mut ack = vec![0x02];
        ack.extend_from_slice(&crc.to_le_bytes());

        let kind = match header {
            HEADER_TAGS => {
                let list = parse_tag_list(body, archive)?;
                if let Some(TagValue::Text(text)) = list.get(TAG_COMMAND_TEXT) {
                    PacketKind::CommandAnswer { text: text.clone() }
                } else {
                    PacketKind::Data(DataPayload::Galileo(list))
                }
            }
            HEADER_IMAGE => PacketKind::Image(ImageEvent::Stream { data: body.to_vec() }),
            other => {
                warn!("galileo: skipping frame with unknown header {other:#04x}");
                return Ok((Packet::with_ack(PacketKind::KeepAlive, raw, ack), total));
            }
        };
        Ok((Packet::with_ack(kind, raw, ack), total))
    }
}

fn parse_tag_list(body: &[u8], archive: bool) -> Result<TagList> {
    let mut r = ByteReader::new(body);
    let mut list = Vec::new();
    while !r.is_empty() {
        let id = r.read_u8()?;
        let width = tag_width(id)
            .ok_or_else(|| CodecError::decode(format!("unknown tag {id:#04x}")))?;
        let data = match width {
            TagWidth::Fixed(n) => r.take(n)?,
            TagWidth::Prefixed => {
                let len = r.read_u8()? as usize;
                r.take(len)?
            }
            TagWidth::Remainder => r.take(r.remaining())?,
        };
        list.push(Tag::decode(id, data)?);
    }
    Ok(TagList { archive, tags: list })
}

/// Command frame: tag packet with the server command number and text.
fn build_command_packet(number: u32, text: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&Tag { id: TAG_COMMAND_NUMBER, value: TagValue::UInt(u64::from(number)) }.encode());
    body.extend_from_slice(&Tag { id: TAG_COMMAND_TEXT, value: TagValue::Text(text.into()) }.encode());
    let mut frame = vec![HEADER_TAGS];
    frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
    frame.extend_from_slice(&body);
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

impl Codec for GalileoCodec {
    fn alias(&self) -> &'static str {
        "galileo"
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
                    warn!("galileo frame dropped: {err}");
                    return ParseOutput { packets, rest: Vec::new() };
                }
            }
        }
        ParseOutput { packets, rest: Vec::new() }
    }

    fn translate(&self, packet: &Packet) -> Result<Vec<TelemetryRecord>> {
        let list = match &packet.kind {
            PacketKind::Data(DataPayload::Galileo(list)) => list,
            _ => return Ok(Vec::new()),
        };
        let mut record = TelemetryRecord::default();
        let mut has_time = false;
        for tag in &list.tags {
            match (tag.id, &tag.value) {
                (TAG_IMEI, TagValue::Text(imei)) => record.uid = imei.clone(),
                (0x01, TagValue::UInt(v)) => record.set_sensor("firmware_version", *v as i64),
                (0x02, TagValue::UInt(v)) => record.set_sensor("software_version", *v as i64),
                (0x04, TagValue::UInt(v)) => record.set_sensor("device_code", *v as i64),
                (0x10, TagValue::UInt(v)) => record.set_sensor("record_number", *v as i64),
                (0x20, TagValue::Time(time)) => {
                    record.time = *time;
                    has_time = true;
                }
                (0x30, TagValue::Position { satellites, correctness, latitude, longitude }) => {
                    record.satellites = Some(u32::from(*satellites));
                    record.latitude = Some(*latitude);
                    record.longitude = Some(*longitude);
                    record.set_sensor("fix_correctness", i64::from(*correctness));
                }
                (0x33, TagValue::Motion { speed, azimuth }) => {
                    record.speed = Some(*speed);
                    record.azimuth = Some(*azimuth);
                }
                (0x34, TagValue::UInt(v)) => record.altitude = Some(*v as f64),
                (0x35, TagValue::UInt(v)) => record.hdop = Some(*v as f64 / 10.0),
                (0x40, TagValue::StatusWord(word)) => {
                    for (name, value) in Tag::status_sensors(*word) {
                        record.set_sensor(name, value);
                    }
                }
                (0x41, TagValue::UInt(v)) => record.set_sensor("ext_battery_voltage", *v as i64),
                (0x42, TagValue::UInt(v)) => record.set_sensor("int_battery_voltage", *v as i64),
                (0x43, TagValue::SInt(v)) => record.set_sensor("int_temperature", *v),
                (0x44, TagValue::Acceleration { x, y, z }) => {
                    record.set_sensor("acceleration_x", i64::from(*x));
                    record.set_sensor("acceleration_y", i64::from(*y));
                    record.set_sensor("acceleration_z", i64::from(*z));
                }
                (0x45, TagValue::PinMask(mask)) => {
                    for idx in 0..16 {
                        record.set_sensor(&format!("dout{idx}"), bit_value(u64::from(*mask), idx));
                    }
                }
                (0x46, TagValue::PinMask(mask)) => {
                    for idx in 0..16 {
                        record.set_sensor(&format!("din{idx}"), bit_value(u64::from(*mask), idx));
                    }
                }
                (0x50..=0x53, TagValue::UInt(v)) => {
                    record.set_sensor(&format!("ain{}", tag.id - 0x50), *v as i64);
                }
                (0x58 | 0x59, TagValue::UInt(v)) => {
                    record.set_sensor(&format!("rs232_{}", tag.id - 0x58), *v as i64);
                }
                (0x70..=0x77, TagValue::Thermometer { id, temperature }) => {
                    record.set_sensor(&format!("ext_temperature_{id}"), i64::from(*temperature));
                }
                (0x90, TagValue::UInt(v)) => record.set_sensor("ibutton", *v as i64),
                (0xC0, TagValue::UInt(v)) => record.set_sensor("fms_fuel_total", *v as f64 / 2.0),
                (0xC1, TagValue::Can { fuel_percent, coolant_temperature, rpm }) => {
                    record.set_sensor("can_fuel_percent", *fuel_percent);
                    record.set_sensor("can_coolant_temperature", *coolant_temperature);
                    record.set_sensor("can_rpm", *rpm);
                }
                (0xC2, TagValue::UInt(v)) => record.set_sensor("fms_odometer", (*v as i64) * 5),
                (0xC4..=0xD2, TagValue::UInt(v)) => {
                    record.set_sensor(&format!("can8bitr{}", tag.id - 0xC4), *v as i64);
                }
                (0xD3, TagValue::UInt(v)) => record.set_sensor("ibutton2", *v as i64),
                (0xD4, TagValue::UInt(v)) => record.set_sensor("odometer", *v as i64),
                (0xD5, TagValue::IButtonState(state)) => {
                    for idx in 0..8 {
                        record.set_sensor(
                            &format!("ibutton_connected_{}", idx + 1),
                            bit_value(u64::from(*state), idx),
                        );
                    }
                }
                (0xD6..=0xDA, TagValue::UInt(v)) => {
                    record.set_sensor(&format!("can16bitr{}", tag.id - 0xD6), *v as i64);
                }
                (0xDB..=0xDF, TagValue::UInt(v)) => {
                    record.set_sensor(&format!("can32bitr{}", tag.id - 0xDB), *v as i64);
                }
                // unrecognized tags are ignored, the rest of the record
                // still goes out
                _ => {}
            }
        }
        if !has_time {
            // pure identification packet (IMEI + code); the uid is learned
            // from the frame itself, nothing to publish
            return Ok(Vec::new());
        }
        if list.archive {
            record.set_sensor("archive", 1i64);
        }
        record.mirror_position_into_sensors();
        Ok(vec![record])
    }

    fn encode_command(&self, command: &DeviceCommand) -> Result<CommandData> {
        match command.alias.as_str() {
            ALIAS_CUSTOM => {
                let message = command
                    .param_str("message")
                    .ok_or_else(|| CodecError::decode("custom command without message"))?;
                let number = command.param_i64("number", 0) as u32;
                Ok(CommandData::Tcp(build_command_packet(number, message)))
            }
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
        Ok(vec![
            SmsPart::text(format!("AddPhone {SMS_PASSWORD}")),
            SmsPart::text(format!("ServerIp {},{}", config.host, config.port)),
            SmsPart::text(format!(
                "APN {},{},{}",
                config.gprs.apn, config.gprs.username, config.gprs.password
            )),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SensorValue;
    use serde_json::json;

    const HEAD_PACKET: &[u8] = b"\x01\x17\x80\x01\x0a\x02\x77\x03868204000728070\x042\x00\x84\x90";

    #[test]
    fn test_identification_packet() {
        let mut codec = GalileoCodec::new(&CodecConfig::default());
        let out = codec.parse_packets(HEAD_PACKET);
        assert_eq!(out.packets.len(), 1);
        let packet = &out.packets[0];
        match &packet.kind {
            PacketKind::Data(DataPayload::Galileo(list)) => {
                assert!(list.archive);
                assert_eq!(list.get(TAG_IMEI), Some(&TagValue::Text("868204000728070".into())));
                assert_eq!(list.get(0x04), Some(&TagValue::UInt(50)));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        // crc 0x9084, acknowledged as 0x02 + crc-le
        assert_eq!(codec.ack(packet).unwrap(), vec![0x02, 0x84, 0x90]);
        // the uid is learned from the frame; no record leaves the gateway
        assert_eq!(packet.uid(), Some("868204000728070"));
        assert!(codec.translate(packet).unwrap().is_empty());
    }

    #[test]
    fn test_command_answer_packet() {
        let mut codec = GalileoCodec::new(&CodecConfig::default());
        let packet = b"\x01\x22\x00\x03868204000728070\x042\x00\xe0\x01\x00\x00\x00\xe1\x08Photo ok\x13\xf6";
        let out = codec.parse_packets(packet);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(
            out.packets[0].kind,
            PacketKind::CommandAnswer { text: "Photo ok".into() }
        );
    }

    #[test]
    fn test_telemetry_packet() {
        let mut codec = GalileoCodec::new(&CodecConfig::default());
        let mut body = Vec::new();
        body.extend_from_slice(b"\x03868204000728070");
        body.extend_from_slice(b"\x20\x13\x04\xAF\x4F"); // 2012-05-13 00:45:07
        body.extend_from_slice(b"\x30\x07\xC0\x0E\x32\x03\xB8\xD7\x2D\x05");
        body.extend_from_slice(b"\x33\x5C\x00\x48\x08");
        body.extend_from_slice(b"\x34\x9B\x00"); // altitude 155
        body.extend_from_slice(b"\x35\x10"); // hdop 1.6
        body.extend_from_slice(b"\x40\xAA\xAA");
        body.extend_from_slice(b"\xC1\xFA\x72\x50\x25");
        let mut frame = vec![HEADER_TAGS];
        frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
        frame.extend_from_slice(&body);
        let crc = crc16_modbus(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let out = codec.parse_packets(&frame);
        assert_eq!(out.packets.len(), 1);
        let records = codec.translate(&out.packets[0]).unwrap();
        let r = &records[0];
        assert_eq!(r.uid, "868204000728070");
        assert_eq!(r.time.format("%Y-%m-%d %H:%M:%S").to_string(), "2012-05-13 00:45:07");
        assert!((r.latitude.unwrap() - 53.612224).abs() < 1e-9);
        assert!((r.longitude.unwrap() - 86.890424).abs() < 1e-9);
        assert_eq!(r.satellites, Some(7));
        assert_eq!(r.speed, Some(9.2));
        assert_eq!(r.azimuth, Some(212.0));
        assert_eq!(r.altitude, Some(155.0));
        assert_eq!(r.hdop, Some(1.6));
        assert_eq!(r.sensor("sos"), Some(&SensorValue::Int(1)));
        assert_eq!(r.sensor("can_rpm"), Some(&SensorValue::Float(1194.0)));
    }

    #[test]
    fn test_image_stream_packet() {
        let mut codec = GalileoCodec::new(&CodecConfig::default());
        let mut frame = vec![HEADER_IMAGE];
        frame.extend_from_slice(&4u16.to_le_bytes());
        frame.extend_from_slice(b"\xFF\xD8\x01\x02");
        let crc = crc16_modbus(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        let out = codec.parse_packets(&frame);
        assert_eq!(
            out.packets[0].kind,
            PacketKind::Image(ImageEvent::Stream { data: b"\xFF\xD8\x01\x02".to_vec() })
        );
    }

    #[test]
    fn test_reframing_three_packets() {
        let mut codec = GalileoCodec::new(&CodecConfig::default());
        let answer = b"\x01\x22\x00\x03868204000728070\x042\x00\xe0\x01\x00\x00\x00\xe1\x08Photo ok\x13\xf6";
        let mut buffer = HEAD_PACKET.to_vec();
        buffer.extend_from_slice(answer);
        buffer.extend_from_slice(answer);
        let out = codec.parse_packets(&buffer);
        assert_eq!(out.packets.len(), 3);
        assert!(out.rest.is_empty());
    }

    #[test]
    fn test_partial_packet_kept() {
        let mut codec = GalileoCodec::new(&CodecConfig::default());
        let out = codec.parse_packets(&HEAD_PACKET[..8]);
        assert!(out.packets.is_empty());
        assert_eq!(out.rest, &HEAD_PACKET[..8]);
    }

    #[test]
    fn test_custom_command_frame() {
        let codec = GalileoCodec::new(&CodecConfig::default());
        let cmd: DeviceCommand = serde_json::from_value(json!({
            "guid": "g", "uid": "868204000728070", "command": "custom",
            "transport": "tcp", "params": {"message": "Makephoto 1", "number": 629633786}
        }))
        .unwrap();
        match codec.encode_command(&cmd).unwrap() {
            CommandData::Tcp(frame) => {
                assert_eq!(frame[0], HEADER_TAGS);
                // 0xE0 number + 0xE1 length-prefixed text
                assert_eq!(&frame[3..4], b"\xE0");
                assert_eq!(&frame[8..10], b"\xE1\x0B");
                assert_eq!(&frame[10..21], b"Makephoto 1");
            }
            other => panic!("unexpected command data: {other:?}"),
        }
    }

    #[test]
    fn test_configure_sms() {
        let codec = GalileoCodec::new(&CodecConfig::default());
        let parts = codec
            .initiation_data(&InitiationConfig {
                identifier: "0123456789012345".into(),
                host: "trx.example.net".into(),
                port: 21001,
                gprs: crate::command::GprsConfig { apn: "tele237.msk".into(), ..Default::default() },
                ..Default::default()
            })
            .unwrap();
        assert_eq!(parts[0].message, "AddPhone 1234");
        assert_eq!(parts[1].message, "ServerIp trx.example.net,21001");
        assert_eq!(parts[2].message, "APN tele237.msk,,");
    }
}
