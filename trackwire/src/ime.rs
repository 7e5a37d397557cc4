//! Ime-family codec (Meitrack-style `$$` framing).
//!
//! Device frames: `$$ <len u16> <imei 7 BCD> <cmd u16> <data>
//! <crc-ccitt u16> \r\n`, where the length counts the whole frame (the 8
//! framing bytes included). Server frames use the `@@` prefix with the
//! same layout. Login (0x5000) is answered with a login confirmation
//! (0x4000); telemetry (0x9955) carries a GPRMC-like ASCII payload.
//!
//! Satellite count is not on the wire, records carry the fabricated 10;
//! HDOP comes from the payload's second `|` part.

use chrono::NaiveDateTime;
use tracing::warn;

use crate::checksum::crc16_ccitt;
use crate::codec::{Codec, CodecConfig, DataPayload, Packet, PacketKind, ParseOutput};
use crate::command::{
    CommandData, DeviceCommand, InitiationConfig, SmsPart, ALIAS_CONFIGURE, ALIAS_CUSTOM,
    ALIAS_RESTART,
};
use crate::error::{CodecError, Result};
use crate::frame::ByteReader;
use crate::geo;
use crate::record::TelemetryRecord;

const PREFIX_DEVICE: u16 = 0x2424; // $$
const PREFIX_SERVER: u16 = 0x4040; // @@

/// Framing overhead counted by the length field
const FRAME_OVERHEAD: usize = 8;

const CMD_LOGIN: u16 = 0x5000;
const CMD_LOGIN_CONFIRMATION: u16 = 0x4000;
const CMD_REBOOT_GPS: u16 = 0x4902;
const ANSWER_DATA: u16 = 0x9955;

const SMS_PASSWORD: &str = "000000";

/// Decoded 0x9955 telemetry payload.
#[derive(Debug, Clone, PartialEq)]
pub struct GprmcReport {
    pub record: TelemetryRecord,
}

#[derive(Debug)]
pub struct ImeCodec;

impl ImeCodec {
    pub fn new(_config: &CodecConfig) -> Self {
        Self
    }

    fn parse_one(&self, buf: &[u8]) -> Result<(Packet, usize)> {
        let mut r = ByteReader::new(buf);
        let prefix = r.read_u16_be()?;
        if prefix != PREFIX_DEVICE {
            return Err(CodecError::framing(format!("bad frame prefix {prefix:#06x}")));
        }
        let total_len = r.read_u16_be()? as usize;
        if total_len < FRAME_OVERHEAD {
            return Err(CodecError::framing(format!("frame length {total_len} too small")));
        }
        let body = r.take(total_len - FRAME_OVERHEAD)?;
        let crc = r.read_u16_be()?;
        let footer = r.take(2)?;
        if footer != b"\r\n" {
            return Err(CodecError::framing("missing frame footer"));
        }
        let total = r.position();
        let computed = crc16_ccitt(&buf[..4 + body.len()]);
        crate::frame::verify_checksum(crc, computed)?;

        let mut b = ByteReader::new(body);
        let imei = decode_bcd_imei(b.take(7)?);
        let command = b.read_u16_be()?;
        let data = b.rest();
        let raw = buf[..total].to_vec();

        let packet = match command {
            CMD_LOGIN => {
                let ack = build_frame(PREFIX_SERVER, &imei, CMD_LOGIN_CONFIRMATION, &[0x01]);
                Packet::with_ack(PacketKind::Login { uid: imei }, raw, ack)
            }
            ANSWER_DATA => {
                let record = parse_gprmc(data)?;
                Packet::new(PacketKind::Data(DataPayload::Ime(GprmcReport { record })), raw)
            }
            other => Packet::new(
                PacketKind::CommandAnswer {
                    text: format!("cmd {other:#06x}: {}", hex::encode(data)),
                },
                raw,
            ),
        };
        Ok((packet, total))
    }
}

/// IMEI digits from 7 BCD bytes; `0xF` nibbles are padding.
fn decode_bcd_imei(bytes: &[u8]) -> String {
    let mut imei = String::with_capacity(14);
    for &byte in bytes {
        for nibble in [byte >> 4, byte & 0x0F] {
            if nibble <= 9 {
                imei.push(char::from(b'0' + nibble));
            }
        }
    }
    imei
}

/// IMEI digits to 7 BCD bytes, right-padded with `0xF` nibbles.
fn encode_bcd_imei(imei: &str) -> [u8; 7] {
    let mut out = [0xFFu8; 7];
    let digits: Vec<u8> = imei.bytes().filter(u8::is_ascii_digit).map(|b| b - b'0').collect();
    for (idx, chunk) in digits.chunks(2).enumerate().take(7) {
        let high = chunk[0];
        let low = chunk.get(1).copied().unwrap_or(0x0F);
        out[idx] = (high << 4) | low;
    }
    out
}

fn build_frame(prefix: u16, imei: &str, command: u16, data: &[u8]) -> Vec<u8> {
    let body_len = 7 + 2 + data.len();
    let mut frame = Vec::with_capacity(body_len + FRAME_OVERHEAD);
    frame.extend_from_slice(&prefix.to_be_bytes());
    frame.extend_from_slice(&((body_len + FRAME_OVERHEAD) as u16).to_be_bytes());
    frame.extend_from_slice(&encode_bcd_imei(imei));
    frame.extend_from_slice(&command.to_be_bytes());
    frame.extend_from_slice(data);
    let crc = crc16_ccitt(&frame);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(b"\r\n");
    frame
}

/// `hhmmss.sss,A,ddmm.mmmm,N,dddmm.mmmm,E,speed,course,ddmmyy,...|hdop|alt|...`
fn parse_gprmc(data: &[u8]) -> Result<TelemetryRecord> {
    let text = std::str::from_utf8(data)
        .map_err(|e| CodecError::decode(format!("telemetry payload not ASCII: {e}")))?;
    let parts: Vec<&str> = text.split('|').collect();
    let gprmc: Vec<&str> = parts[0].split(',').collect();
    if gprmc.len() < 9 {
        return Err(CodecError::decode(format!("short GPRMC fragment: {:?}", parts[0])));
    }

    let stamp = format!("{},{}", gprmc[8], gprmc[0]);
    let time = NaiveDateTime::parse_from_str(&stamp, "%d%m%y,%H%M%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&stamp, "%d%m%y,%H%M%S"))
        .map_err(|e| CodecError::decode(format!("bad time {stamp:?}: {e}")))?;

    let mut record = TelemetryRecord::at(time);
    record.latitude = geo::parse_latitude(&format!("{}{}", gprmc[2], gprmc[3]));
    record.longitude = geo::parse_longitude(&format!("{}{}", gprmc[4], gprmc[5]));
    record.speed = Some(geo::knots_to_kmh(gprmc[6].parse().unwrap_or(0.0)));
    record.azimuth = Some(gprmc[7].parse().unwrap_or(0.0));
    record.satellites = Some(10); // fabricated, not on the wire
    record.hdop = Some(parts.get(1).and_then(|v| v.parse().ok()).unwrap_or(0.0));
    record.altitude = Some(parts.get(2).and_then(|v| v.parse().ok()).unwrap_or(0.0));
    record.mirror_position_into_sensors();
    Ok(record)
}

impl Codec for ImeCodec {
    fn alias(&self) -> &'static str {
        "ime"
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
                    warn!("ime frame dropped: {err}");
                    return ParseOutput { packets, rest: Vec::new() };
                }
            }
        }
        ParseOutput { packets, rest: Vec::new() }
    }

    fn translate(&self, packet: &Packet) -> Result<Vec<TelemetryRecord>> {
        match &packet.kind {
            PacketKind::Data(DataPayload::Ime(report)) => Ok(vec![report.record.clone()]),
            _ => Ok(Vec::new()),
        }
    }

    fn encode_command(&self, command: &DeviceCommand) -> Result<CommandData> {
        match command.alias.as_str() {
            ALIAS_RESTART => Ok(CommandData::Tcp(build_frame(
                PREFIX_SERVER,
                &command.uid,
                CMD_REBOOT_GPS,
                &[],
            ))),
            ALIAS_CUSTOM => {
                let message = command
                    .param_str("message")
                    .ok_or_else(|| CodecError::decode("custom command without message"))?;
                Ok(CommandData::Tcp(message.as_bytes().to_vec()))
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
            SmsPart::text(format!("W{SMS_PASSWORD},010,{}", config.identifier)),
            SmsPart::text(format!(
                "W{SMS_PASSWORD},011,{},{},{}",
                config.gprs.apn, config.gprs.username, config.gprs.password
            )),
            SmsPart::text(format!("W{SMS_PASSWORD},013,1")),
            SmsPart::text(format!(
                "W{SMS_PASSWORD},012,1,{},{}",
                config.host, config.port
            )),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LOGIN_PACKET: &[u8] =
        b"\x24\x24\x00\x11\x13\x61\x23\x45\x67\x8f\xff\x50\x00\x05\xd8\x0d\x0a";

    const DATA_PACKET: &[u8] =
        b"\x24\x24\x00\x60\x12\x34\x56\xFF\xFF\xFF\xFF\x99\x55\x30\x33\x35\x36\x34\x34\x2E\x30\
\x30\x30\x2C\x41\x2C\x32\x32\x33\x32\x2E\x36\x30\x38\x33\x2C\x4E\x2C\x31\x31\x34\x30\x34\x2E\
\x38\x31\x33\x37\x2C\x45\x2C\x30\x2E\x30\x30\x2C\x2C\x30\x31\x30\x38\x30\x39\x2C\x2C\x2A\x31\
\x43\x7C\x31\x31\x2E\x35\x7C\x31\x39\x34\x7C\x30\x30\x30\x30\x7C\x30\x30\x30\x30\x2C\x30\x30\
\x30\x30\x69\x62\x0D\x0A";

    #[test]
    fn test_login_and_confirmation() {
        let mut codec = ImeCodec::new(&CodecConfig::default());
        let out = codec.parse_packets(LOGIN_PACKET);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(out.packets[0].kind, PacketKind::Login { uid: "13612345678".into() });
        // confirmation goes out under the server prefix with success = 1
        assert_eq!(
            codec.ack(&out.packets[0]).unwrap(),
            b"@@\x00\x12\x12\x34\x56\xFF\xFF\xFF\xFF\x40\x00\x01\xA9\x9B\r\n".to_vec()
        );
    }

    #[test]
    fn test_telemetry_packet() {
        let mut codec = ImeCodec::new(&CodecConfig::default());
        let out = codec.parse_packets(DATA_PACKET);
        assert_eq!(out.packets.len(), 1);
        let records = codec.translate(&out.packets[0]).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.time.format("%Y-%m-%d %H:%M:%S").to_string(), "2009-08-01 03:56:44");
        assert!((r.latitude.unwrap() - 22.543471666).abs() < 1e-6);
        assert!((r.longitude.unwrap() - 114.080228333).abs() < 1e-6);
        assert_eq!(r.speed, Some(0.0));
        assert_eq!(r.azimuth, Some(0.0));
        assert_eq!(r.satellites, Some(10)); // fabricated
        assert_eq!(r.hdop, Some(11.5));
        assert_eq!(r.altitude, Some(194.0));
    }

    #[test]
    fn test_bcd_imei_roundtrip() {
        assert_eq!(decode_bcd_imei(&[0x13, 0x61, 0x23, 0x45, 0x67, 0x8F, 0xFF]), "13612345678");
        assert_eq!(
            encode_bcd_imei("13612345678"),
            [0x13, 0x61, 0x23, 0x45, 0x67, 0x8F, 0xFF]
        );
    }

    #[test]
    fn test_partial_frame_kept() {
        let mut codec = ImeCodec::new(&CodecConfig::default());
        let out = codec.parse_packets(&LOGIN_PACKET[..9]);
        assert!(out.packets.is_empty());
        assert_eq!(out.rest, &LOGIN_PACKET[..9]);
    }

    #[test]
    fn test_two_frames_reframed() {
        let mut codec = ImeCodec::new(&CodecConfig::default());
        let mut buffer = LOGIN_PACKET.to_vec();
        buffer.extend_from_slice(DATA_PACKET);
        let out = codec.parse_packets(&buffer);
        assert_eq!(out.packets.len(), 2);
    }

    #[test]
    fn test_restart_command() {
        let codec = ImeCodec::new(&CodecConfig::default());
        let cmd: DeviceCommand = serde_json::from_value(json!({
            "guid": "g", "uid": "13612345678", "command": "restart_tracker",
            "transport": "tcp", "params": {}
        }))
        .unwrap();
        match codec.encode_command(&cmd).unwrap() {
            CommandData::Tcp(frame) => {
                assert!(frame.starts_with(b"@@"));
                assert_eq!(&frame[11..13], &CMD_REBOOT_GPS.to_be_bytes());
                assert!(frame.ends_with(b"\r\n"));
            }
            other => panic!("unexpected command data: {other:?}"),
        }
    }

    #[test]
    fn test_configure_sms() {
        let codec = ImeCodec::new(&CodecConfig::default());
        let parts = codec
            .initiation_data(&InitiationConfig {
                identifier: "0123456789012345".into(),
                host: "trx.example.net".into(),
                port: 21001,
                gprs: crate::command::GprsConfig { apn: "internet".into(), ..Default::default() },
                ..Default::default()
            })
            .unwrap();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1].message, "W000000,011,internet,,");
        assert_eq!(parts[3].message, "W000000,012,1,trx.example.net,21001");
    }
}
