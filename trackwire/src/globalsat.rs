//! Globalsat ASCII codec (TR-151/TR-203/TR-206/TR-600, GTR-128).
//!
//! Line form `GS?,<fields>*<HH>!` with an XOR-LRC checksum rendered as two
//! hex chars. Which fields appear in a report line is configured per
//! firmware as an ordered character map (`reportFormat`); the codec
//! compiles a regex from it at construction time. `GSs` lines carry device
//! settings, accumulated by the session until transmission status 2.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use regex::Regex;
use tracing::{debug, warn};

use crate::checksum::xor_lrc_hex;
use crate::codec::{Codec, CodecConfig, DataPayload, Packet, PacketKind, ParseOutput};
use crate::command::{
    CommandData, DeviceCommand, InitiationConfig, SmsPart, ALIAS_ACTIVATE_OUTPUT,
    ALIAS_CONFIGURE, ALIAS_CUSTOM, ALIAS_DEACTIVATE_OUTPUT,
};
use crate::error::{CodecError, Result};
use crate::geo;
use crate::record::TelemetryRecord;

/// Default report format of the TR-600 firmware, checksum part truncated.
const DEFAULT_REPORT_FORMAT: &str = "SPRXYAB27GHKLMmnaefghio";

const CONFIG_PATTERN: &str =
    r"GSs,(?P<uid>\w+),(?P<status>\d+),(?P<order>\d+),(?P<data>.*?)\*[A-Fa-f\d]{1,2}!";
const UID_PATTERN: &str = r"GS\w,(?P<uid>\w+)";

/// Wire pattern for each report field code. Codes missing here match the
/// unknown-field pattern.
fn field_pattern(code: char) -> &'static str {
    match code {
        'A' => r"[1-3]",
        'B' | 'C' => r"\d{6},\d{6}",
        '1' => r"[EW]\d{3}\.\d{6}",
        '2' => r"[EW]\d{5}\.\d{4}",
        '3' => r"[+-]\d{9}",
        '6' => r"[NS]\d{2}\.\d{6}",
        '7' => r"[NS]\d{4}\.\d{4}",
        '8' => r"[+-]\d{8}",
        'G' | 'K' | 'L' | 'N' => r"\d+",
        'H' | 'M' => r"\d+(?:\.\d+)?",
        'P' | 'V' | 'W' => r"[0-9A-Fa-f]{2,}",
        'R' => r"\w",
        'S' | 'T' => r"\w+",
        'X' => r"[\w\.]+",
        'Y' => r"\w{4}",
        'a' | 'e' | 'f' | 'g' | 'h' | 'i' | 'm' | 'o' => r"\d+",
        'n' => r"(?:\w+|\d+%)",
        _ => r"[\w\.]*",
    }
}

/// One matched report line: field code (digits prefixed with `d`) to value.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub fields: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct GlobalsatCodec {
    report_re: Regex,
    config_re: Regex,
    uid_re: Regex,
    report_format: String,
    initial_config: String,
}

impl GlobalsatCodec {
    pub fn new(config: &CodecConfig) -> Result<Self> {
        let report_format = truncate_checksum(config.get_or("reportFormat", DEFAULT_REPORT_FORMAT));
        let mut fields = String::new();
        for code in report_format.chars() {
            let name = field_name(code);
            fields.push_str(&format!(",(?P<{}>{})", name, field_pattern(code)));
        }
        let line = format!(r"(?P<line>(?P<head>GS\w){fields})\*(?P<checksum>\w+)!");
        let report_re = Regex::new(&line)
            .map_err(|e| CodecError::Config(format!("bad report format {report_format:?}: {e}")))?;
        Ok(Self {
            report_re,
            config_re: Regex::new(CONFIG_PATTERN).expect("static pattern"),
            uid_re: Regex::new(UID_PATTERN).expect("static pattern"),
            report_format,
            initial_config: config.get_or("initialConfig", "").to_string(),
        })
    }

    fn parse_report(&self, text: &str) -> Option<Packet> {
        let m = self.report_re.captures(text)?;
        let line = &m["line"];
        let given = m["checksum"].to_ascii_uppercase();
        let computed = xor_lrc_hex(line);
        if given != computed {
            warn!("incorrect checksum: {given} against computed {computed}");
            return None;
        }
        let mut fields = Vec::new();
        for code in self.report_format.chars() {
            let name = field_name(code);
            if let Some(value) = m.name(&name) {
                fields.push((name, value.as_str().to_string()));
            }
        }
        let raw = m.get(0).expect("match").as_str().as_bytes().to_vec();
        let mut packet = Packet::new(PacketKind::Data(DataPayload::Globalsat(Report { fields })), raw);
        // SOS alarm: answer with the stop-signal command
        if let Some((_, p_value)) = packet_field(&packet, "P") {
            if let Ok(alarm) = u64::from_str_radix(&p_value, 16) {
                if alarm & 1 == 1 {
                    if let Some((_, uid)) = packet_field(&packet, "S") {
                        packet.ack = Some(internal_command(&uid, "Na").into_bytes());
                    }
                }
            }
        }
        Some(packet)
    }
}

fn field_name(code: char) -> String {
    if code.is_ascii_digit() {
        format!("d{code}")
    } else {
        code.to_string()
    }
}

fn packet_field(packet: &Packet, name: &str) -> Option<(String, String)> {
    match &packet.kind {
        PacketKind::Data(DataPayload::Globalsat(report)) => report
            .fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(n, v)| (n.clone(), v.clone())),
        _ => None,
    }
}

/// `GSC,<uid>,<text>` with checksum appended.
fn internal_command(uid: &str, text: &str) -> String {
    add_checksum(&format!("GSC,{uid},{text}"))
}

fn add_checksum(data: &str) -> String {
    format!("{data}*{}!", xor_lrc_hex(data))
}

fn truncate_checksum(value: &str) -> String {
    match value.find('*') {
        Some(idx) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

/// `NNNNmV` or raw number to millivolts.
fn parse_voltage(value: &str) -> f64 {
    let digits = value.strip_suffix("mV").unwrap_or(value);
    digits.parse().unwrap_or(0.0)
}

/// `NN%` to percent; voltages and raw numbers read as a full battery.
fn parse_battery_level(value: &str) -> f64 {
    if let Some(percent) = value.strip_suffix('%') {
        return percent.parse().unwrap_or(0.0);
    }
    if value.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return 100.0;
    }
    0.0
}

impl Codec for GlobalsatCodec {
    fn alias(&self) -> &'static str {
        "globalsat"
    }

    fn parse_packets(&mut self, buf: &[u8]) -> ParseOutput {
        let text = String::from_utf8_lossy(buf);
        let mut packets = Vec::new();
        let mut consumed = 0usize;

        // interleave report and settings sentences in buffer order
        let mut matches: Vec<(usize, usize, bool)> = self
            .report_re
            .find_iter(&text)
            .map(|m| (m.start(), m.end(), true))
            .chain(self.config_re.find_iter(&text).map(|m| (m.start(), m.end(), false)))
            .collect();
        matches.sort_by_key(|(start, _, _)| *start);

        for (start, end, is_report) in matches {
            let sentence = &text[start..end];
            if is_report {
                if let Some(packet) = self.parse_report(sentence) {
                    packets.push(packet);
                }
            } else if let Some(m) = self.config_re.captures(sentence) {
                let status = m["status"].parse().unwrap_or(0);
                packets.push(Packet::new(
                    PacketKind::Settings {
                        uid: m["uid"].to_string(),
                        status,
                        data: m["data"].to_string(),
                    },
                    sentence.as_bytes().to_vec(),
                ));
            }
            consumed = end;
        }

        let tail = &text[consumed..];
        if tail.contains('!') {
            // complete but unmatched sentences: wrong report format for
            // this device, try to at least name it in the log
            match self.uid_re.captures(tail) {
                Some(m) => warn!("unknown data format for {}", &m["uid"]),
                None => warn!("unknown data format"),
            }
            ParseOutput { packets, rest: Vec::new() }
        } else {
            ParseOutput {
                packets,
                rest: tail.as_bytes().to_vec(),
            }
        }
    }

    fn translate(&self, packet: &Packet) -> Result<Vec<TelemetryRecord>> {
        let report = match &packet.kind {
            PacketKind::Data(DataPayload::Globalsat(report)) => report,
            _ => return Ok(Vec::new()),
        };
        let mut record = TelemetryRecord::default();
        for (name, raw_value) in &report.fields {
            let value = if raw_value.is_empty() { "0" } else { raw_value.as_str() };
            match name.as_str() {
                "S" => record.uid = value.to_string(),
                "B" => {
                    record.time = NaiveDateTime::parse_from_str(value, "%d%m%y,%H%M%S")
                        .map_err(|e| CodecError::decode(format!("bad time {value:?}: {e}")))?;
                }
                "d1" | "d2" | "d3" => record.longitude = geo::parse_longitude(value),
                "d6" | "d7" | "d8" => record.latitude = geo::parse_latitude(value),
                "G" => record.altitude = value.parse().ok().map(f64::round),
                "H" => record.speed = value.parse().ok().map(geo::knots_to_kmh),
                "I" => record.speed = value.parse().ok(),
                "J" => record.speed = value.parse().ok().map(geo::mph_to_kmh),
                "K" => record.azimuth = value.parse().ok().map(f64::round),
                "L" => record.satellites = value.parse().ok(),
                "M" => record.hdop = value.parse().ok(),
                "i" => {
                    if let Ok(v) = value.parse::<f64>() {
                        record.set_sensor("odometer", v);
                    }
                }
                // report cause: implicit movement sensor, lower priority
                // than the status word
                "R" => {
                    if record.sensor("moving").is_none() {
                        let stopped = matches!(value, "4" | "E" | "F");
                        record.set_sensor("moving", u8::from(!stopped));
                    }
                }
                "Y" => {
                    let status = u64::from_str_radix(value, 16)
                        .map_err(|e| CodecError::decode(format!("bad status word {value:?}: {e}")))?;
                    record.set_sensor("din1", crate::bits::bit_value(status, 1));
                    record.set_sensor("din2", crate::bits::bit_value(status, 2));
                    record.set_sensor("din3", crate::bits::bit_value(status, 3));
                    record.set_sensor("moving", crate::bits::bit_value(status, 7));
                    record.set_sensor("dout1", crate::bits::bit_value(status, 9));
                    record.set_sensor("dout2", crate::bits::bit_value(status, 10));
                    record.set_sensor("dout3", crate::bits::bit_value(status, 11));
                    record.set_sensor("acc", crate::bits::bit_value(status, 13));
                    record.set_sensor("sat_antenna_connected", crate::bits::bit_value(status, 14));
                    record.set_sensor("ext_battery_connected", crate::bits::bit_value(status, 15));
                }
                "P" => {
                    let alarm = u64::from_str_radix(value, 16).unwrap_or(0);
                    record.set_sensor("sos", crate::bits::bit_value(alarm, 0));
                }
                "e" | "f" | "g" | "h" => {
                    let idx = (name.as_bytes()[0] - b'e') as usize;
                    if let Ok(v) = value.parse::<f64>() {
                        record.set_sensor(&format!("counter{idx}"), v);
                    }
                }
                "a" => {
                    if let Ok(v) = value.parse::<f64>() {
                        record.set_sensor("ain0", v);
                    }
                }
                "m" => record.set_sensor("ext_battery_voltage", parse_voltage(value)),
                "n" => record.set_sensor("int_battery_level", parse_battery_level(value)),
                _ => {}
            }
        }
        record.mirror_position_into_sensors();
        debug!(uid = %record.uid, "globalsat report translated");
        Ok(vec![record])
    }

    fn encode_command(&self, command: &DeviceCommand) -> Result<CommandData> {
        match command.alias.as_str() {
            ALIAS_ACTIVATE_OUTPUT | ALIAS_DEACTIVATE_OUTPUT => {
                let output = command.param_i64("outputNumber", 0);
                let state = u8::from(command.alias == ALIAS_ACTIVATE_OUTPUT);
                let text = internal_command(&command.uid, &format!("Lo({output},{state})"));
                Ok(CommandData::Tcp(text.into_bytes()))
            }
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
        let mut text = format!("GSS,{},3,0", config.identifier);
        text.push_str(&format!(",O3={}", self.report_format));
        text.push_str(&self.initial_config);
        text.push_str(&format!(",D1={}", config.gprs.apn));
        text.push_str(&format!(",D2={}", config.gprs.username));
        text.push_str(&format!(",D3={}", config.gprs.password));
        text.push_str(&format!(",E0={}", config.host));
        text.push_str(&format!(",E1={}", config.port));
        Ok(vec![SmsPart::text(add_checksum(&text))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SensorValue;
    use serde_json::json;

    fn codec_with_format(format: &str) -> GlobalsatCodec {
        let mut config = CodecConfig::default();
        config.settings.insert("reportFormat".into(), format.into());
        GlobalsatCodec::new(&config).unwrap()
    }

    fn tr600_line() -> String {
        let body = "GSr,357460032240926,00,6,e000,e000,3,050711,143314,\
                    E05012.6060,N5314.5480,155,1.13,46,6,1.6,13790,13670mV,0,0,0,0,0,7603,0";
        format!("{body}*{}!", xor_lrc_hex(body))
    }

    #[test]
    fn test_tr600_report() {
        // speed column carries km/h in this format variant
        let mut codec = codec_with_format("SPRXYAB27GIKLMmnaefghio");
        let out = codec.parse_packets(tr600_line().as_bytes());
        assert_eq!(out.packets.len(), 1);
        assert!(out.rest.is_empty());

        let records = codec.translate(&out.packets[0]).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.uid, "357460032240926");
        assert_eq!(r.time.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(), "2011-07-05T14:33:14.000000");
        assert!((r.longitude.unwrap() - 50.2101).abs() < 1e-6);
        assert!((r.latitude.unwrap() - (53.0 + 14.548 / 60.0)).abs() < 1e-6);
        assert_eq!(r.altitude, Some(155.0));
        assert!((r.speed.unwrap() - 1.13).abs() < 1e-9);
        assert_eq!(r.azimuth, Some(46.0));
        assert_eq!(r.satellites, Some(6));
        assert_eq!(r.hdop, Some(1.6));
        assert_eq!(r.sensor("odometer"), Some(&SensorValue::Float(7603.0)));
        assert_eq!(r.sensor("ext_battery_voltage"), Some(&SensorValue::Float(13790.0)));
        assert_eq!(r.sensor("int_battery_level"), Some(&SensorValue::Float(100.0)));
        // status word 0xe000: acc + antenna + external power, not moving
        assert_eq!(r.sensor("acc"), Some(&SensorValue::Int(1)));
        assert_eq!(r.sensor("moving"), Some(&SensorValue::Int(0)));
        assert_eq!(r.sensor("sos"), Some(&SensorValue::Int(0)));
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let mut codec = codec_with_format("SPRXYAB27GIKLMmnaefghio");
        let mut line = tr600_line();
        line.replace_range(line.len() - 3..line.len() - 1, "ZZ");
        let out = codec.parse_packets(line.as_bytes());
        assert!(out.packets.is_empty());
        assert!(out.rest.is_empty());
    }

    #[test]
    fn test_partial_line_kept() {
        let mut codec = codec_with_format("SPRXYAB27GIKLMmnaefghio");
        let line = tr600_line();
        let (first, rest) = line.split_at(40);
        let out = codec.parse_packets(first.as_bytes());
        assert!(out.packets.is_empty());
        assert_eq!(out.rest, first.as_bytes());

        let mut buffer = out.rest;
        buffer.extend_from_slice(rest.as_bytes());
        let out = codec.parse_packets(&buffer);
        assert_eq!(out.packets.len(), 1);
    }

    #[test]
    fn test_two_lines_in_one_read() {
        let mut codec = codec_with_format("SPRXYAB27GIKLMmnaefghio");
        let doubled = format!("{}{}", tr600_line(), tr600_line());
        let out = codec.parse_packets(doubled.as_bytes());
        assert_eq!(out.packets.len(), 2);
    }

    #[test]
    fn test_settings_line() {
        let mut codec = codec_with_format("SPRXYAB27GIKLMmnaefghio");
        let out = codec.parse_packets(b"GSs,357460032240926,2,0,O5=357460032240926,O7=1.2*10!");
        assert_eq!(out.packets.len(), 1);
        match &out.packets[0].kind {
            PacketKind::Settings { uid, status, data } => {
                assert_eq!(uid, "357460032240926");
                assert_eq!(*status, 2);
                assert_eq!(data, "O5=357460032240926,O7=1.2");
            }
            other => panic!("unexpected packet kind: {other:?}"),
        }
    }

    #[test]
    fn test_sos_triggers_stop_command() {
        let mut codec = codec_with_format("SPRXYAB27GIKLMmnaefghio");
        let body = "GSr,357460032240926,01,6,e000,e000,3,050711,143314,\
                    E05012.6060,N5314.5480,155,1.13,46,6,1.6,13790,13670mV,0,0,0,0,0,7603,0";
        let line = format!("{body}*{}!", xor_lrc_hex(body));
        let out = codec.parse_packets(line.as_bytes());
        let ack = codec.ack(&out.packets[0]).unwrap();
        let expected = internal_command("357460032240926", "Na");
        assert_eq!(ack, expected.as_bytes());
    }

    #[test]
    fn test_activate_digital_output() {
        let codec = codec_with_format("SPRXYAB27GIKLMmnaefghio");
        let cmd: DeviceCommand = serde_json::from_value(json!({
            "guid": "g1",
            "uid": "357460032240926",
            "command": "activate_digital_output",
            "transport": "tcp",
            "params": {"outputNumber": 2}
        }))
        .unwrap();
        let data = codec.encode_command(&cmd).unwrap();
        let body = "GSC,357460032240926,Lo(2,1)";
        let expected = format!("{body}*{}!", xor_lrc_hex(body));
        assert_eq!(data, CommandData::Tcp(expected.into_bytes()));
    }

    #[test]
    fn test_configure_sms() {
        let codec = codec_with_format("SPRXYAB27GIKLMmnaefghio");
        let parts = codec
            .initiation_data(&InitiationConfig {
                identifier: "0123456789012345".into(),
                host: "trx.example.net".into(),
                port: 21202,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].message.starts_with("GSS,0123456789012345,3,0,O3=SPRXYAB27GIKLMmnaefghio,"));
        assert!(parts[0].message.contains(",E0=trx.example.net,E1=21202*"));
        assert!(!parts[0].bin);
    }

    #[test]
    fn test_restart_unsupported() {
        let codec = codec_with_format("SPRXYAB27GIKLMmnaefghio");
        let cmd: DeviceCommand = serde_json::from_value(json!({
            "guid": "g", "uid": "1", "command": "restart_tracker", "params": {}
        }))
        .unwrap();
        assert!(matches!(
            codec.encode_command(&cmd).unwrap_err(),
            CodecError::UnsupportedCommand(_)
        ));
    }
}
