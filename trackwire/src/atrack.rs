//! ATrack codec (AX5 and relatives).
//!
//! Three frame shapes share the link:
//! - keep-alive `0xFE 0x02 <unitId u64> <seq u16>`, echoed back verbatim;
//! - ASCII command answers `$CMD+TAG=p1,p2,...\r\n`;
//! - `@P` position reports: prefix, CRC-16 (init 0) over length+body,
//!   length, sequence, unit id and a run of report items. A report is
//!   acknowledged with a keep-alive carrying its unit id and sequence.
//!
//! The tail of every report item is a configurable `%XX` custom-info field
//! list (`customInfo` setting), matching what the firmware was told to
//! append.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use tracing::warn;

use crate::checksum::{crc16, CRC16_INIT_DF1};
use crate::codec::{Codec, CodecConfig, DataPayload, Packet, PacketKind, ParseOutput};
use crate::command::{CommandData, DeviceCommand, InitiationConfig, SmsPart, ALIAS_CUSTOM};
use crate::error::{CodecError, Result};
use crate::frame::ByteReader;
use crate::record::TelemetryRecord;

const KEEPALIVE_PREFIX: [u8; 2] = [0xFE, 0x02];
const RESPONSE_PREFIX: u8 = b'$';
const DEFAULT_REPORT_PREFIX: &str = "@P";

const RESPONSE_PATTERN: &str = r"^\$(?P<command>\w+)\+?(?P<tag>\w+)?(?:=(?P<params>.+))?\r\n";

/// Field width of a custom-info code, `None` for NUL-terminated strings.
fn custom_field(code: &str) -> Option<(Option<CustomWidth>, &'static str)> {
    use CustomWidth::*;
    let entry = match code {
        "SA" => (Some(U8), "sat_count"),
        "MV" => (Some(U16), "ext_battery_voltage"),
        "BV" => (Some(U16), "int_battery_voltage"),
        "GQ" => (Some(U8), "gsm_signal_quality"),
        "CE" => (Some(U16), "gsm_cell_id"),
        "LC" => (Some(U16), "gsm_cell_lac"),
        "CN" => (Some(U32), "gsm_mcc_mnc"),
        "RL" => (Some(U8), "gsm_rxlev"),
        "PC" => (Some(U32), "pulse_count_value"),
        "AT" => (Some(U32), "altitude"),
        "RP" => (Some(U16), "can_rpm"),
        "GS" => (Some(U8), "gsm_status"),
        "DT" => (Some(U8), "report_type"),
        "VN" => (None, "vin"),
        "MF" => (Some(U16), "can_mass_airflow_rate"),
        "EL" => (Some(U8), "can_engine_load"),
        "TR" => (Some(U8), "can_throttle_position"),
        "ET" => (Some(I16), "can_coolant_temperature"),
        "FL" => (Some(U8), "can_fuel_percent"),
        "ML" => (Some(U8), "can_mil_status"),
        "FC" => (Some(U32), "can_total_fuel_consumption"),
        "CI" => (None, "custom_info"),
        "AV1" => (Some(U16), "ain0"),
        "NC" => (None, "gsm_neighbor_cell_info"),
        "SM" => (Some(U16), "speed_max"),
        _ => return None,
    };
    Some(entry)
}

#[derive(Debug, Clone, Copy)]
enum CustomWidth {
    U8,
    U16,
    I16,
    U32,
}

/// Decoded `@P` report.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionReport {
    pub sequence: u16,
    pub unit_id: String,
    pub records: Vec<TelemetryRecord>,
}

#[derive(Debug)]
pub struct AtrackCodec {
    report_prefix: Vec<u8>,
    custom_info: Vec<String>,
    /// 0 = epoch seconds, anything else = calendar fields
    time_format: u8,
    response_re: Regex,
}

impl AtrackCodec {
    pub fn new(config: &CodecConfig) -> Self {
        let custom_info = config
            .get_or("customInfo", "")
            .split('%')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            report_prefix: config
                .get_or("positionReportPrefix", DEFAULT_REPORT_PREFIX)
                .as_bytes()
                .to_vec(),
            custom_info,
            time_format: config.get_or("timeFormat", "0").parse().unwrap_or(0),
            response_re: Regex::new(RESPONSE_PATTERN).expect("static pattern"),
        }
    }

    fn parse_one(&self, buf: &[u8]) -> Result<(Packet, usize)> {
        if buf.starts_with(&KEEPALIVE_PREFIX) {
            return self.parse_keepalive(buf);
        }
        if buf.first() == Some(&RESPONSE_PREFIX) {
            return self.parse_response(buf);
        }
        if buf.starts_with(&self.report_prefix) {
            return self.parse_report(buf);
        }
        if buf.len() < 2 {
            return Err(CodecError::Truncated { needed: 2 - buf.len() });
        }
        Err(CodecError::framing("unknown packet structure"))
    }

    fn parse_keepalive(&self, buf: &[u8]) -> Result<(Packet, usize)> {
        let mut r = ByteReader::new(buf);
        let _prefix = r.take(2)?;
        let unit_id = r.read_u64_be()?;
        let _sequence = r.read_u16_be()?;
        let total = r.position();
        let raw = buf[..total].to_vec();
        // echoed verbatim
        let ack = raw.clone();
        Ok((
            Packet::with_ack(PacketKind::Login { uid: unit_id.to_string() }, raw, ack),
            total,
        ))
    }

    fn parse_response(&self, buf: &[u8]) -> Result<(Packet, usize)> {
        let end = buf
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or(CodecError::Truncated { needed: 1 })?
            + 2;
        let line = std::str::from_utf8(&buf[..end])
            .map_err(|e| CodecError::decode(format!("bad command answer: {e}")))?;
        if !self.response_re.is_match(line) {
            return Err(CodecError::framing(format!("bad command answer {line:?}")));
        }
        Ok((
            Packet::new(
                PacketKind::CommandAnswer { text: line.trim_end().to_string() },
                buf[..end].to_vec(),
            ),
            end,
        ))
    }

    fn parse_report(&self, buf: &[u8]) -> Result<(Packet, usize)> {
        let mut r = ByteReader::new(buf);
        let _prefix = r.take(self.report_prefix.len())?;
        let checksum = r.read_u16_be()?;
        let length = r.read_u16_be()? as usize;
        let body = r.take(length)?;
        let total = r.position();

        let mut check = (length as u16).to_be_bytes().to_vec();
        check.extend_from_slice(body);
        let computed = crc16(&check, CRC16_INIT_DF1);
        crate::frame::verify_checksum(checksum, computed)?;

        let mut b = ByteReader::new(body);
        let sequence = b.read_u16_be()?;
        let unit_id = b.read_u64_be()?.to_string();
        let mut records = Vec::new();
        while !b.is_empty() {
            records.push(self.parse_item(&mut b)?);
        }

        // report ack: keep-alive with the same unit id and sequence
        let mut ack = KEEPALIVE_PREFIX.to_vec();
        ack.extend_from_slice(&unit_id.parse::<u64>().unwrap_or(0).to_be_bytes());
        ack.extend_from_slice(&sequence.to_be_bytes());

        Ok((
            Packet::with_ack(
                PacketKind::Data(DataPayload::Atrack(PositionReport {
                    sequence,
                    unit_id,
                    records,
                })),
                buf[..total].to_vec(),
                ack,
            ),
            total,
        ))
    }

    fn read_time(&self, b: &mut ByteReader<'_>) -> Result<NaiveDateTime> {
        if self.time_format == 0 {
            let ts = b.read_u32_be()?;
            DateTime::from_timestamp(i64::from(ts), 0)
                .map(|t| t.naive_utc())
                .ok_or_else(|| CodecError::decode(format!("bad timestamp {ts}")))
        } else {
            let year = b.read_u16_be()?;
            let month = b.read_u8()?;
            let day = b.read_u8()?;
            let hour = b.read_u8()?;
            let minute = b.read_u8()?;
            let second = b.read_u8()?;
            NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
                .and_then(|d| d.and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second)))
                .ok_or_else(|| CodecError::decode("bad calendar time"))
        }
    }

    fn parse_item(&self, b: &mut ByteReader<'_>) -> Result<TelemetryRecord> {
        let time = self.read_time(b)?;
        let time_rtc = self.read_time(b)?;
        let time_send = self.read_time(b)?;

        let mut record = TelemetryRecord::at(time);
        record.longitude = Some(f64::from(b.read_i32_be()?) / 1_000_000.0);
        record.latitude = Some(f64::from(b.read_i32_be()?) / 1_000_000.0);
        record.azimuth = Some(f64::from(b.read_u16_be()?));
        let report_id = b.read_u8()?;
        let odometer = u64::from(b.read_u32_be()?) * 100;
        record.hdop = Some(f64::from(b.read_u16_be()?) / 10.0);
        let din = b.read_u8()?;
        record.speed = Some(f64::from(b.read_u16_be()?));
        let dout = b.read_u8()?;
        for idx in 0..8 {
            record.set_sensor(&format!("din{idx}"), crate::bits::bit_value(u64::from(din), idx));
            record.set_sensor(&format!("dout{idx}"), crate::bits::bit_value(u64::from(dout), idx));
        }
        record.set_sensor("report_id", i64::from(report_id));
        record.set_sensor("odometer", odometer as i64);
        record.set_sensor("ain0", i64::from(b.read_u16_be()?));
        let driver_id = read_cstr(b)?;
        if !driver_id.is_empty() {
            record.set_sensor("driver_id", driver_id.as_str());
        }
        record.set_sensor("ext_temperature_0", i64::from(b.read_i16_be()?));
        record.set_sensor("ext_temperature_1", i64::from(b.read_i16_be()?));
        let message = read_cstr(b)?;
        if !message.is_empty() {
            record.set_sensor("message", message.as_str());
        }
        record.set_sensor("time_rtc", time_rtc.format("%Y-%m-%dT%H:%M:%S%.6f").to_string().as_str());
        record.set_sensor("time_send", time_send.format("%Y-%m-%dT%H:%M:%S%.6f").to_string().as_str());

        for code in &self.custom_info {
            let Some((width, name)) = custom_field(code) else {
                warn!("atrack: unknown custom info field {code}");
                continue;
            };
            match width {
                None => {
                    let text = read_cstr(b)?;
                    record.set_sensor(name, text.as_str());
                }
                Some(CustomWidth::U8) => {
                    let value = i64::from(b.read_u8()?);
                    record.set_sensor(name, value);
                }
                Some(CustomWidth::U16) => {
                    let value = i64::from(b.read_u16_be()?);
                    // battery fields arrive in hundredths of a volt
                    if name.ends_with("battery_voltage") {
                        record.set_sensor(name, value * 100);
                    } else {
                        record.set_sensor(name, value);
                    }
                }
                Some(CustomWidth::I16) => {
                    let value = i64::from(b.read_i16_be()?);
                    record.set_sensor(name, value);
                }
                Some(CustomWidth::U32) => {
                    let value = i64::from(b.read_u32_be()?);
                    if name == "can_total_fuel_consumption" {
                        record.set_sensor(name, value as f64 / 10.0);
                    } else {
                        record.set_sensor(name, value);
                    }
                }
            }
        }
        // a couple of custom fields feed the positional columns
        if let Some(crate::record::SensorValue::Int(v)) = record.sensor("sat_count").cloned() {
            record.satellites = Some(v as u32);
        }
        if let Some(crate::record::SensorValue::Int(v)) = record.sensor("altitude").cloned() {
            record.altitude = Some(v as f64);
        }
        record.mirror_position_into_sensors();
        Ok(record)
    }
}

fn read_cstr(b: &mut ByteReader<'_>) -> Result<String> {
    let bytes = b.take_until(0)?;
    Ok(String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned())
}

impl Codec for AtrackCodec {
    fn alias(&self) -> &'static str {
        "atrack"
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
                    warn!("atrack frame dropped: {err}");
                    return ParseOutput { packets, rest: Vec::new() };
                }
            }
        }
        ParseOutput { packets, rest: Vec::new() }
    }

    fn translate(&self, packet: &Packet) -> Result<Vec<TelemetryRecord>> {
        match &packet.kind {
            PacketKind::Data(DataPayload::Atrack(report)) => {
                let mut records = report.records.clone();
                for record in &mut records {
                    record.uid = report.unit_id.clone();
                }
                Ok(records)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn encode_command(&self, command: &DeviceCommand) -> Result<CommandData> {
        match command.alias.as_str() {
            ALIAS_CUSTOM => {
                let message = command
                    .param_str("message")
                    .ok_or_else(|| CodecError::decode("custom command without message"))?;
                Ok(CommandData::Tcp(format!("{message}\r\n").into_bytes()))
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
    use crate::record::SensorValue;

    const KEEPALIVE: &[u8] = b"\xfe\x02\x00\x01\x41\x04\xd8\xdd\x8f\x28\x00\x01";

    fn codec() -> AtrackCodec {
        let mut config = CodecConfig::default();
        config.settings.insert("customInfo".into(), "%SA%MV".into());
        AtrackCodec::new(&config)
    }

    fn report_item() -> Vec<u8> {
        let mut item = Vec::new();
        for _ in 0..3 {
            item.extend_from_slice(&1_368_441_581u32.to_be_bytes()); // 2013-05-13 10:39:41
        }
        item.extend_from_slice(&37_660_096i32.to_be_bytes()); // longitude
        item.extend_from_slice(&55_788_660i32.to_be_bytes()); // latitude
        item.extend_from_slice(&120u16.to_be_bytes()); // azimuth
        item.push(2); // report id
        item.extend_from_slice(&5u32.to_be_bytes()); // odometer / 100
        item.extend_from_slice(&21u16.to_be_bytes()); // hdop * 10
        item.push(0b0000_0101); // din
        item.extend_from_slice(&64u16.to_be_bytes()); // speed
        item.push(0b0000_0010); // dout
        item.extend_from_slice(&512u16.to_be_bytes()); // ain0
        item.extend_from_slice(b"DRIVER7\x00");
        item.extend_from_slice(&5i16.to_be_bytes());
        item.extend_from_slice(&(-3i16).to_be_bytes());
        item.push(0); // empty message
        item.push(7); // SA
        item.extend_from_slice(&125u16.to_be_bytes()); // MV, hundredths of a volt
        item
    }

    fn report_frame() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&26u16.to_be_bytes()); // sequence
        body.extend_from_slice(&352_964_050_784_041u64.to_be_bytes());
        body.extend_from_slice(&report_item());
        let mut check = (body.len() as u16).to_be_bytes().to_vec();
        check.extend_from_slice(&body);
        let crc = crc16(&check, CRC16_INIT_DF1);
        let mut frame = b"@P".to_vec();
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn test_keepalive_echo() {
        let mut codec = codec();
        let out = codec.parse_packets(KEEPALIVE);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(
            out.packets[0].kind,
            PacketKind::Login { uid: "352964050784040".into() }
        );
        // echoed back byte for byte
        assert_eq!(codec.ack(&out.packets[0]).unwrap(), KEEPALIVE.to_vec());
    }

    #[test]
    fn test_command_answer_lines() {
        let mut codec = codec();
        let out = codec.parse_packets(b"$UNID=352964050784041\r\n$OK\r\n");
        assert_eq!(out.packets.len(), 2);
        assert_eq!(
            out.packets[0].kind,
            PacketKind::CommandAnswer { text: "$UNID=352964050784041".into() }
        );
        assert_eq!(out.packets[1].kind, PacketKind::CommandAnswer { text: "$OK".into() });
    }

    #[test]
    fn test_position_report() {
        let mut codec = codec();
        let frame = report_frame();
        let out = codec.parse_packets(&frame);
        assert_eq!(out.packets.len(), 1);

        let records = codec.translate(&out.packets[0]).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.uid, "352964050784041");
        assert_eq!(r.time.format("%Y-%m-%d %H:%M:%S").to_string(), "2013-05-13 10:39:41");
        assert!((r.longitude.unwrap() - 37.660096).abs() < 1e-9);
        assert!((r.latitude.unwrap() - 55.78866).abs() < 1e-9);
        assert_eq!(r.azimuth, Some(120.0));
        assert_eq!(r.hdop, Some(2.1));
        assert_eq!(r.speed, Some(64.0));
        assert_eq!(r.satellites, Some(7));
        assert_eq!(r.sensor("odometer"), Some(&SensorValue::Int(500)));
        assert_eq!(r.sensor("din0"), Some(&SensorValue::Int(1)));
        assert_eq!(r.sensor("din1"), Some(&SensorValue::Int(0)));
        assert_eq!(r.sensor("dout1"), Some(&SensorValue::Int(1)));
        assert_eq!(r.sensor("driver_id"), Some(&SensorValue::Text("DRIVER7".into())));
        assert_eq!(r.sensor("ext_temperature_1"), Some(&SensorValue::Int(-3)));
        assert_eq!(r.sensor("ext_battery_voltage"), Some(&SensorValue::Int(12500)));

        // acked with a keep-alive carrying unit id and sequence
        let ack = codec.ack(&out.packets[0]).unwrap();
        assert_eq!(&ack[..2], &KEEPALIVE_PREFIX);
        assert_eq!(&ack[10..], &26u16.to_be_bytes());
    }

    #[test]
    fn test_bad_crc_dropped() {
        let mut codec = codec();
        let mut frame = report_frame();
        frame[2] ^= 0xFF;
        let out = codec.parse_packets(&frame);
        assert!(out.packets.is_empty());
        assert!(out.rest.is_empty());
    }

    #[test]
    fn test_partial_response_line_kept() {
        let mut codec = codec();
        let out = codec.parse_packets(b"$INFO=35296405078");
        assert!(out.packets.is_empty());
        assert_eq!(out.rest, b"$INFO=35296405078");
    }

    #[test]
    fn test_custom_command() {
        let codec = codec();
        let cmd: DeviceCommand = serde_json::from_value(serde_json::json!({
            "guid": "g", "uid": "352964050784041", "command": "custom",
            "params": {"message": "AT$INFO"}
        }))
        .unwrap();
        assert_eq!(
            codec.encode_command(&cmd).unwrap(),
            CommandData::Tcp(b"AT$INFO\r\n".to_vec())
        );
    }
}
