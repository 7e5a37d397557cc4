//! Naviset binary codec (GT-10/GT-20).
//!
//! Frame: 2 bytes little-endian where the low 14 bits are the body length
//! and the top 2 bits the packet kind (0 head, 1 data, 2 command answer),
//! then the body and a little-endian CRC-16/Modbus over everything before
//! it. Every packet is acknowledged with `0x01` followed by the received
//! CRC.
//!
//! A data body is the device number, a 16-bit `dataStructure` mask, and a
//! stream of fixed-layout records. Each set mask bit appends a fixed-size
//! chunk to every record; the chunk table below is reconstructed from live
//! GT-20 traffic.

use chrono::{DateTime, NaiveDateTime};
use tracing::warn;

use crate::bits::bit_test;
use crate::checksum::crc16_modbus;
use crate::codec::{Codec, CodecConfig, DataPayload, ImageEvent, Packet, PacketKind, ParseOutput};
use crate::command::{
    CommandData, DeviceCommand, InitiationConfig, SmsPart, ALIAS_ACTIVATE_OUTPUT,
    ALIAS_CONFIGURE, ALIAS_CUSTOM, ALIAS_DEACTIVATE_OUTPUT, ALIAS_RESTART,
};
use crate::error::{CodecError, Result};
use crate::frame::ByteReader;
use crate::geo;
use crate::record::TelemetryRecord;

const KIND_HEAD: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_ANSWER: u8 = 2;

const CMD_HEADER: u8 = 0x02;
const CMD_CONFIGURE_OUTPUTS: u8 = 13;
const CMD_RESTART: u8 = 18;
const CMD_GET_IMAGE: u8 = 20;

const OUTPUT_TURN_OFF: u8 = 0;
const OUTPUT_TURN_ON: u8 = 1;

/// `CommandGetImage` answer sub-codes
const IMAGE_CODE_SIZE: u8 = 0;
const IMAGE_CODE_DATA: u8 = 1;
const IMAGE_CODE_CAMERA: u8 = 2;

/// Image chunk confirmation value
const IMAGE_CONFIRM_OK: u8 = 0;

const SMS_PASSWORD: &str = "1234";

/// Additional-data chunk size for each `dataStructure` bit.
pub const DS_SIZES: [usize; 16] = [1, 2, 2, 1, 6, 8, 4, 8, 6, 2, 2, 4, 4, 2, 4, 4];

/// Temperature value a disconnected thermometer reports
const THERMO_ABSENT: i8 = -128;

/// Decoded data body: device number plus its records.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    pub device_number: u16,
    pub records: Vec<TelemetryRecord>,
}

#[derive(Debug)]
pub struct NavisetCodec;

impl NavisetCodec {
    pub fn new(_config: &CodecConfig) -> Self {
        Self
    }

    fn parse_one(&self, buf: &[u8]) -> Result<(Packet, usize)> {
        let mut r = ByteReader::new(buf);
        let prefix = r.read_u16_le()?;
        let kind = (prefix >> 14) as u8;
        let length = (prefix & 0x3FFF) as usize;
        let body = r.take(length)?;
        let crc = r.read_u16_le()?;
        let total = r.position();
        let computed = crc16_modbus(&buf[..2 + length]);
        crate::frame::verify_checksum(crc, computed)?;

        let raw = buf[..total].to_vec();
        let ack = ack_bytes(crc);
        let packet = match kind {
            KIND_HEAD => {
                let mut b = ByteReader::new(body);
                let _device_number = b.read_u16_le()?;
                let imei = std::str::from_utf8(b.take(15)?)
                    .map_err(|e| CodecError::decode(format!("bad IMEI: {e}")))?
                    .to_string();
                let _protocol_version = b.read_u8()?;
                Packet::with_ack(PacketKind::Login { uid: imei }, raw, ack)
            }
            KIND_DATA => {
                let block = parse_data_block(body)?;
                Packet::with_ack(PacketKind::Data(DataPayload::Naviset(block)), raw, ack)
            }
            KIND_ANSWER => parse_answer(body, raw, ack)?,
            other => return Err(CodecError::framing(format!("unknown packet kind {other}"))),
        };
        Ok((packet, total))
    }
}

fn ack_bytes(crc: u16) -> Vec<u8> {
    let mut ack = vec![0x01];
    ack.extend_from_slice(&crc.to_le_bytes());
    ack
}

fn parse_answer(body: &[u8], raw: Vec<u8>, ack: Vec<u8>) -> Result<Packet> {
    let mut b = ByteReader::new(body);
    let number = b.read_u8()?;
    if number != CMD_GET_IMAGE {
        let text = common_answer_text(number, b.rest());
        return Ok(Packet::with_ack(PacketKind::CommandAnswer { text }, raw, ack));
    }
    let code = b.read_u8()?;
    let event = match code {
        IMAGE_CODE_SIZE => ImageEvent::Announce {
            size: b.read_u32_le()? as usize,
        },
        IMAGE_CODE_DATA => {
            let index = b.read_u16_le()?;
            let len = b.read_u16_le()? as usize;
            ImageEvent::Chunk {
                index,
                data: b.take(len)?.to_vec(),
            }
        }
        IMAGE_CODE_CAMERA => ImageEvent::CameraStatus { code: b.read_u8()? },
        other => return Err(CodecError::decode(format!("unknown image answer code {other}"))),
    };
    // confirm the transfer step together with the frame ack
    let mut ack = ack;
    ack.extend_from_slice(&build_command(CMD_GET_IMAGE, &[IMAGE_CONFIRM_OK]));
    Ok(Packet::with_ack(PacketKind::Image(event), raw, ack))
}

fn common_answer_text(number: u8, payload: &[u8]) -> String {
    format!("cmd {number}: {}", hex::encode(payload))
}

fn parse_data_block(body: &[u8]) -> Result<DataBlock> {
    let mut b = ByteReader::new(body);
    let device_number = b.read_u16_le()?;
    let structure = b.read_u16_le()?;
    let mut records = Vec::new();
    while !b.is_empty() {
        records.push(parse_record(&mut b, structure)?);
    }
    Ok(DataBlock { device_number, records })
}

fn parse_record(b: &mut ByteReader<'_>, structure: u16) -> Result<TelemetryRecord> {
    let number = b.read_u16_le()?;
    let timestamp = b.read_u32_le()?;
    let time = DateTime::from_timestamp(i64::from(timestamp), 0)
        .map(|t| t.naive_utc())
        .ok_or_else(|| CodecError::decode(format!("bad timestamp {timestamp}")))?;

    let mut record = TelemetryRecord::at(time);
    record.satellites = Some(u32::from(b.read_u8()?));
    record.latitude = Some(geo::from_naviset(b.read_u32_le()?));
    record.longitude = Some(geo::from_naviset(b.read_u32_le()?));
    record.speed = Some(f64::from(b.read_u16_le()?) / 10.0);
    record.azimuth = Some(f64::from(b.read_u16_le()?) / 10.0);
    record.altitude = Some(f64::from(b.read_u16_le()?));
    record.hdop = Some(f64::from(b.read_u8()?) / 10.0);
    record.set_sensor("record_number", i64::from(number));

    for bit in 0..16u32 {
        if !bit_test(u64::from(structure), bit) {
            continue;
        }
        parse_additional(b, bit, &mut record)?;
    }
    record.mirror_position_into_sensors();
    Ok(record)
}

fn parse_additional(b: &mut ByteReader<'_>, bit: u32, record: &mut TelemetryRecord) -> Result<()> {
    match bit {
        0 => {
            let status = u64::from(b.read_u8()?);
            record.set_sensor("sos", crate::bits::bit_value(status, 0));
            record.set_sensor("acc", crate::bits::bit_value(status, 1));
            record.set_sensor("moving", crate::bits::bit_value(status, 2));
            record.set_sensor("ext_battery_connected", crate::bits::bit_value(status, 3));
            record.set_sensor("sat_antenna_connected", crate::bits::bit_value(status, 5));
        }
        1 => record.set_sensor("ext_battery_voltage", i64::from(b.read_u16_le()?)),
        2 => record.set_sensor("int_battery_voltage", i64::from(b.read_u16_le()?)),
        3 => record.set_sensor("int_temperature", i64::from(b.read_i8()?)),
        4 => {
            let id = read_u48_le(b)?;
            record.set_sensor("ibutton", id as i64);
        }
        5 => {
            for idx in 0..4 {
                let value = b.read_u16_le()?;
                record.set_sensor(&format!("ain{idx}"), i64::from(value));
            }
        }
        6 => {
            for idx in 0..2 {
                let value = b.read_u16_le()?;
                record.set_sensor(&format!("fuel_frequency{idx}"), i64::from(value));
            }
        }
        7 => {
            for idx in 0..8 {
                let value = b.read_i8()?;
                if value != THERMO_ABSENT {
                    record.set_sensor(&format!("ext_temperature_{idx}"), i64::from(value));
                }
            }
        }
        8 => {
            let id = read_u48_le(b)?;
            record.set_sensor("ibutton2", id as i64);
        }
        9 => {
            let mask = u64::from(b.read_u16_le()?);
            for idx in 0..16 {
                record.set_sensor(&format!("din{idx}"), crate::bits::bit_value(mask, idx));
            }
        }
        10 => {
            let mask = u64::from(b.read_u16_le()?);
            for idx in 0..16 {
                record.set_sensor(&format!("dout{idx}"), crate::bits::bit_value(mask, idx));
            }
        }
        11 => {
            for idx in 0..2 {
                let value = b.read_u16_le()?;
                record.set_sensor(&format!("fuel_level{idx}"), i64::from(value));
            }
        }
        12 => {
            let fuel = b.read_u8()?;
            let coolant = b.read_u8()?;
            let rpm = b.read_u16_le()?;
            record.set_sensor("can_fuel_percent", f64::from(fuel) * 0.4);
            record.set_sensor("can_coolant_temperature", i64::from(coolant) - 40);
            record.set_sensor("can_rpm", f64::from(rpm) * 0.125);
        }
        13 => record.set_sensor("can_speed", i64::from(b.read_u16_le()?)),
        14 => record.set_sensor("odometer", i64::from(b.read_u32_le()?)),
        15 => record.set_sensor("can_odometer", i64::from(b.read_u32_le()?)),
        _ => unreachable!("dataStructure has 16 bits"),
    }
    Ok(())
}

fn read_u48_le(b: &mut ByteReader<'_>) -> Result<u64> {
    let bytes = b.take(6)?;
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= u64::from(byte) << (8 * i);
    }
    Ok(value)
}

/// Command frame: header byte, command number, body, CRC-16/Modbus LE.
fn build_command(number: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![CMD_HEADER, number];
    frame.extend_from_slice(body);
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

impl Codec for NavisetCodec {
    fn alias(&self) -> &'static str {
        "naviset"
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
                    warn!("naviset frame dropped: {err}");
                    return ParseOutput { packets, rest: Vec::new() };
                }
            }
        }
        ParseOutput { packets, rest: Vec::new() }
    }

    fn translate(&self, packet: &Packet) -> Result<Vec<TelemetryRecord>> {
        match &packet.kind {
            PacketKind::Data(DataPayload::Naviset(block)) => Ok(block.records.clone()),
            _ => Ok(Vec::new()),
        }
    }

    fn encode_command(&self, command: &DeviceCommand) -> Result<CommandData> {
        match (command.alias.as_str(), command.transport) {
            (ALIAS_RESTART, crate::command::Transport::Tcp) => {
                Ok(CommandData::Tcp(build_command(CMD_RESTART, &[])))
            }
            (ALIAS_RESTART, crate::command::Transport::Sms) => Ok(CommandData::Sms(vec![
                SmsPart::text(format!("COM96 {SMS_PASSWORD}")),
            ])),
            (ALIAS_ACTIVATE_OUTPUT | ALIAS_DEACTIVATE_OUTPUT, transport) => {
                let mode = if command.alias == ALIAS_ACTIVATE_OUTPUT {
                    OUTPUT_TURN_ON
                } else {
                    OUTPUT_TURN_OFF
                };
                let output = command.param_i64("outputNumber", 0) as u8;
                match transport {
                    crate::command::Transport::Tcp => {
                        let body = [(mode << 4) | (output & 0x0F), 0, 0, 0];
                        Ok(CommandData::Tcp(build_command(CMD_CONFIGURE_OUTPUTS, &body)))
                    }
                    crate::command::Transport::Sms => Ok(CommandData::Sms(vec![SmsPart::text(
                        format!("COM7 {SMS_PASSWORD},{},{}", output + 1, mode),
                    )])),
                }
            }
            (ALIAS_CUSTOM, _) => {
                let message = command
                    .param_str("message")
                    .ok_or_else(|| CodecError::decode("custom command without message"))?;
                Ok(CommandData::Tcp(message.as_bytes().to_vec()))
            }
            (ALIAS_CONFIGURE, _) => {
                let config = command
                    .config
                    .as_ref()
                    .and_then(InitiationConfig::from_value)
                    .ok_or_else(|| CodecError::decode("configure command without config"))?;
                Ok(CommandData::Sms(self.initiation_data(&config)?))
            }
            ("get_image", crate::command::Transport::Tcp) => {
                let kind = command.param_i64("type", 0) as u8;
                Ok(CommandData::Tcp(build_command(CMD_GET_IMAGE, &[kind])))
            }
            (other, _) => Err(CodecError::UnsupportedCommand(other.to_string())),
        }
    }

    fn initiation_data(&self, config: &InitiationConfig) -> Result<Vec<SmsPart>> {
        Ok(vec![
            SmsPart::text(format!(
                "COM3 {SMS_PASSWORD},{},{}",
                config.host, config.port
            )),
            SmsPart::text(format!(
                "COM13 {SMS_PASSWORD},1,{},{},{}#",
                config.gprs.apn, config.gprs.username, config.gprs.password
            )),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HEAD_PACKET: &[u8] = b"\x12\x00\x01\x00012896001609129\x06\x9f\xb9";

    fn frame(kind: u8, body: &[u8]) -> Vec<u8> {
        let prefix = (u16::from(kind) << 14) | body.len() as u16;
        let mut data = prefix.to_le_bytes().to_vec();
        data.extend_from_slice(body);
        let crc = crc16_modbus(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }

    fn sample_record(structure: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&10600u16.to_le_bytes()); // record number
        body.extend_from_slice(&0x515C_F08Fu32.to_le_bytes()); // 2013-04-04 03:28:15 UTC
        body.push(16); // satellites
        body.extend_from_slice(&53_243_104u32.to_le_bytes()); // latitude
        body.extend_from_slice(&50_183_400u32.to_le_bytes()); // longitude
        body.extend_from_slice(&123u16.to_le_bytes()); // speed * 10
        body.extend_from_slice(&900u16.to_le_bytes()); // azimuth * 10
        body.extend_from_slice(&155u16.to_le_bytes()); // altitude
        body.push(16); // hdop * 10
        if structure & 0x000F == 0x000F {
            body.push(0b0010_1000); // status: ext power + antenna
            body.extend_from_slice(&11450u16.to_le_bytes());
            body.extend_from_slice(&3292u16.to_le_bytes());
            body.push(36i8 as u8);
        }
        body
    }

    #[test]
    fn test_head_packet() {
        let mut codec = NavisetCodec::new(&CodecConfig::default());
        let out = codec.parse_packets(HEAD_PACKET);
        assert_eq!(out.packets.len(), 1);
        assert!(out.rest.is_empty());
        let packet = &out.packets[0];
        assert_eq!(packet.kind, PacketKind::Login { uid: "012896001609129".into() });
        // ack is 0x01 plus the received crc, little endian
        assert_eq!(codec.ack(packet).unwrap(), vec![0x01, 0x9F, 0xB9]);
    }

    #[test]
    fn test_data_packet() {
        let mut codec = NavisetCodec::new(&CodecConfig::default());
        let structure = 0x000Fu16;
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_le_bytes()); // device number
        body.extend_from_slice(&structure.to_le_bytes());
        body.extend_from_slice(&sample_record(structure));
        body.extend_from_slice(&sample_record(structure));
        let out = codec.parse_packets(&frame(KIND_DATA, &body));
        assert_eq!(out.packets.len(), 1);

        let records = codec.translate(&out.packets[0]).unwrap();
        assert_eq!(records.len(), 2);
        let r = &records[0];
        assert!((r.latitude.unwrap() - 53.243104).abs() < 1e-9);
        assert!((r.longitude.unwrap() - 50.1834).abs() < 1e-9);
        assert_eq!(r.satellites, Some(16));
        assert!((r.speed.unwrap() - 12.3).abs() < 1e-9);
        assert!((r.azimuth.unwrap() - 90.0).abs() < 1e-9);
        assert_eq!(r.altitude, Some(155.0));
        assert_eq!(r.time.format("%Y-%m-%d %H:%M:%S").to_string(), "2013-04-04 03:28:15");
        assert_eq!(
            r.sensor("ext_battery_voltage"),
            Some(&crate::record::SensorValue::Int(11450))
        );
        assert_eq!(r.sensor("int_temperature"), Some(&crate::record::SensorValue::Int(36)));
        assert_eq!(r.sensor("sat_antenna_connected"), Some(&crate::record::SensorValue::Int(1)));
        assert_eq!(r.sensor("sos"), Some(&crate::record::SensorValue::Int(0)));
    }

    #[test]
    fn test_ds_sizes_total() {
        // full mask adds 60 bytes per record
        assert_eq!(DS_SIZES.iter().sum::<usize>(), 60);
    }

    #[test]
    fn test_two_packets_reframed() {
        let mut codec = NavisetCodec::new(&CodecConfig::default());
        let mut buffer = HEAD_PACKET.to_vec();
        buffer.extend_from_slice(HEAD_PACKET);
        let out = codec.parse_packets(&buffer);
        assert_eq!(out.packets.len(), 2);
        assert!(out.rest.is_empty());
    }

    #[test]
    fn test_partial_packet_kept() {
        let mut codec = NavisetCodec::new(&CodecConfig::default());
        let out = codec.parse_packets(&HEAD_PACKET[..10]);
        assert!(out.packets.is_empty());
        assert_eq!(out.rest, &HEAD_PACKET[..10]);
    }

    #[test]
    fn test_bad_crc_dropped() {
        let mut codec = NavisetCodec::new(&CodecConfig::default());
        let mut data = HEAD_PACKET.to_vec();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        let out = codec.parse_packets(&data);
        assert!(out.packets.is_empty());
        assert!(out.rest.is_empty());
    }

    #[test]
    fn test_image_answer_chunk() {
        let mut codec = NavisetCodec::new(&CodecConfig::default());
        let mut body = vec![CMD_GET_IMAGE, IMAGE_CODE_DATA];
        body.extend_from_slice(&3u16.to_le_bytes()); // chunk number
        body.extend_from_slice(&4u16.to_le_bytes()); // chunk length
        body.extend_from_slice(b"\xFF\xD8\x00\x01");
        let out = codec.parse_packets(&frame(KIND_ANSWER, &body));
        assert_eq!(out.packets.len(), 1);
        match &out.packets[0].kind {
            PacketKind::Image(ImageEvent::Chunk { index, data }) => {
                assert_eq!(*index, 3);
                assert_eq!(data, b"\xFF\xD8\x00\x01");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        // the ack carries the frame ack plus the image confirmation command
        let ack = codec.ack(&out.packets[0]).unwrap();
        assert_eq!(ack[0], 0x01);
        let confirm = build_command(CMD_GET_IMAGE, &[IMAGE_CONFIRM_OK]);
        assert!(ack.ends_with(&confirm));
    }

    #[test]
    fn test_restart_command() {
        let codec = NavisetCodec::new(&CodecConfig::default());
        let cmd: DeviceCommand = serde_json::from_value(json!({
            "guid": "g", "uid": "1", "command": "restart_tracker", "transport": "tcp", "params": {}
        }))
        .unwrap();
        let data = codec.encode_command(&cmd).unwrap();
        let expected = build_command(CMD_RESTART, &[]);
        assert_eq!(data, CommandData::Tcp(expected));
    }

    #[test]
    fn test_activate_output_packs_mode_and_number() {
        let codec = NavisetCodec::new(&CodecConfig::default());
        let cmd: DeviceCommand = serde_json::from_value(json!({
            "guid": "g", "uid": "1", "command": "activate_digital_output",
            "transport": "tcp", "params": {"outputNumber": 2}
        }))
        .unwrap();
        match codec.encode_command(&cmd).unwrap() {
            CommandData::Tcp(bytes) => {
                assert_eq!(bytes[0], CMD_HEADER);
                assert_eq!(bytes[1], CMD_CONFIGURE_OUTPUTS);
                assert_eq!(bytes[2], (OUTPUT_TURN_ON << 4) | 2);
            }
            other => panic!("unexpected command data: {other:?}"),
        }
    }

    #[test]
    fn test_configure_sms() {
        let codec = NavisetCodec::new(&CodecConfig::default());
        let parts = codec
            .initiation_data(&InitiationConfig {
                identifier: "0123456789012345".into(),
                host: "trx.example.net".into(),
                port: 21200,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(parts[0].message, "COM3 1234,trx.example.net,21200");
        assert_eq!(parts[1].message, "COM13 1234,1,,,#");
    }
}
