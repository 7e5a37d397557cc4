//! Galileo tag table: wire widths and value decoders.
//!
//! A tag packet body is a flat `(tag-id, value)` sequence where the value
//! width is a property of the id. Most widths are fixed; 0xE1 carries a
//! one-byte length prefix and 0x00 (camera data) consumes the body
//! remainder.

use chrono::{DateTime, NaiveDateTime};

use crate::bits::{bit_range, bit_value};
use crate::error::{CodecError, Result};
use crate::frame::ByteReader;
use crate::geo;

/// How many value bytes a tag occupies on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagWidth {
    Fixed(usize),
    /// One-byte length prefix before the value (0xE1)
    Prefixed,
    /// Value is the rest of the packet body (0x00)
    Remainder,
}

/// Width lookup for every known tag id.
pub fn tag_width(id: u8) -> Option<TagWidth> {
    use TagWidth::*;
    let width = match id {
        0x00 => Remainder,
        0x01 | 0x02 => Fixed(1),
        0x03 => Fixed(15),
        0x04 | 0x10 => Fixed(2),
        0x20 => Fixed(4),
        0x30 => Fixed(9),
        0x33 => Fixed(4),
        0x34 => Fixed(2),
        0x35 => Fixed(1),
        0x40..=0x42 => Fixed(2),
        0x43 => Fixed(1),
        0x44 => Fixed(4),
        0x45 | 0x46 => Fixed(2),
        0x47 => Fixed(4),
        0x50..=0x53 => Fixed(2),
        0x58 | 0x59 => Fixed(2),
        0x70..=0x77 => Fixed(2),
        0x90 => Fixed(4),
        0xA0..=0xAF => Fixed(1),
        0xB0..=0xB9 => Fixed(2),
        0xC0..=0xC3 => Fixed(4),
        0xC4..=0xD2 => Fixed(1),
        0xD3 | 0xD4 => Fixed(4),
        0xD5 => Fixed(1),
        0xD6..=0xDA => Fixed(2),
        0xDB..=0xDF => Fixed(4),
        0xE0 => Fixed(4),
        0xE1 => Prefixed,
        0xF0..=0xF9 => Fixed(4),
        _ => return None,
    };
    Some(width)
}

/// Decoded tag value.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    UInt(u64),
    SInt(i64),
    Text(String),
    Time(NaiveDateTime),
    /// 0x30: satellite count, fix correctness, position
    Position {
        satellites: u8,
        correctness: u8,
        latitude: f64,
        longitude: f64,
    },
    /// 0x33: speed and azimuth, both in tenths
    Motion { speed: f64, azimuth: f64 },
    /// 0x44: three 10-bit axes
    Acceleration { x: u16, y: u16, z: u16 },
    /// 0x40: device status word
    StatusWord(u16),
    /// 0x45 douts / 0x46 dins
    PinMask(u16),
    /// 0x70..0x77: thermometer id and temperature
    Thermometer { id: u8, temperature: u8 },
    /// 0xC1: CAN fuel percent, coolant temperature, engine RPM
    Can {
        fuel_percent: f64,
        coolant_temperature: i64,
        rpm: f64,
    },
    /// 0xD5: iButton connection bits
    IButtonState(u8),
    /// 0x00: raw camera bytes
    Bytes(Vec<u8>),
}

/// A decoded tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub id: u8,
    pub value: TagValue,
}

impl Tag {
    /// Decode one tag value from its raw bytes.
    pub fn decode(id: u8, data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let value = match id {
            0x00 => TagValue::Bytes(data.to_vec()),
            0x03 | 0xE1 => TagValue::Text(
                std::str::from_utf8(data)
                    .map_err(|e| CodecError::decode(format!("tag {id:#04x}: {e}")))?
                    .to_string(),
            ),
            0x20 => {
                let ts = r.read_u32_le()?;
                TagValue::Time(
                    DateTime::from_timestamp(i64::from(ts), 0)
                        .map(|t| t.naive_utc())
                        .ok_or_else(|| CodecError::decode(format!("bad timestamp {ts}")))?,
                )
            }
            0x30 => {
                let satcor = r.read_u8()?;
                let latitude = geo::from_microdegrees(r.read_i32_le()?);
                let longitude = geo::from_microdegrees(r.read_i32_le()?);
                TagValue::Position {
                    satellites: satcor & 0x0F,
                    correctness: satcor >> 4,
                    latitude,
                    longitude,
                }
            }
            0x33 => TagValue::Motion {
                speed: f64::from(r.read_u16_le()?) / 10.0,
                azimuth: f64::from(r.read_u16_le()?) / 10.0,
            },
            0x40 => TagValue::StatusWord(r.read_u16_le()?),
            0x43 => TagValue::SInt(i64::from(r.read_i8()?)),
            0x44 => {
                let packed = u64::from(r.read_u32_le()?);
                TagValue::Acceleration {
                    x: bit_range(packed, 0, 10) as u16,
                    y: bit_range(packed, 10, 20) as u16,
                    z: bit_range(packed, 20, 30) as u16,
                }
            }
            0x45 | 0x46 => TagValue::PinMask(r.read_u16_le()?),
            0x70..=0x77 => TagValue::Thermometer {
                id: r.read_u8()?,
                temperature: r.read_u8()?,
            },
            0xC1 => {
                let fuel = r.read_u8()?;
                let coolant = r.read_u8()?;
                let rpm = r.read_u16_le()?;
                TagValue::Can {
                    fuel_percent: f64::from(fuel) * 0.4,
                    coolant_temperature: if coolant != 0 { i64::from(coolant) - 40 } else { 0 },
                    rpm: f64::from(rpm) * 0.125,
                }
            }
            0xD5 => TagValue::IButtonState(r.read_u8()?),
            _ => match data.len() {
                1 => TagValue::UInt(u64::from(r.read_u8()?)),
                2 => TagValue::UInt(u64::from(r.read_u16_le()?)),
                4 => TagValue::UInt(u64::from(r.read_u32_le()?)),
                n => return Err(CodecError::decode(format!("tag {id:#04x}: odd width {n}"))),
            },
        };
        Ok(Tag { id, value })
    }

    /// Encode the tag back to its wire form, including the id byte (and
    /// the length prefix where the tag carries one).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.id];
        match (&self.value, tag_width(self.id)) {
            (TagValue::Text(text), Some(TagWidth::Prefixed)) => {
                out.push(text.len() as u8);
                out.extend_from_slice(text.as_bytes());
            }
            (TagValue::Text(text), _) => out.extend_from_slice(text.as_bytes()),
            (TagValue::UInt(v), Some(TagWidth::Fixed(1))) => out.push(*v as u8),
            (TagValue::UInt(v), Some(TagWidth::Fixed(2))) => {
                out.extend_from_slice(&(*v as u16).to_le_bytes())
            }
            (TagValue::UInt(v), _) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
            (TagValue::Bytes(data), _) => out.extend_from_slice(data),
            (other, _) => {
                debug_assert!(false, "encode not supported for {other:?}");
            }
        }
        out
    }

    /// Expand the status word into its named booleans.
    pub fn status_sensors(word: u16) -> Vec<(&'static str, i64)> {
        let w = u64::from(word);
        vec![
            ("moving", i64::from(bit_value(w, 0))),
            ("critical_angle", i64::from(bit_value(w, 1))),
            ("gsm_no_sim_card", i64::from(bit_value(w, 3))),
            ("geofence_presence", i64::from(bit_value(w, 4))),
            ("int_battery_low_level", i64::from(bit_value(w, 5))),
            ("sat_antenna_connected", i64::from(1 - bit_value(w, 6))),
            ("bad_bus_voltage", i64::from(bit_value(w, 7))),
            ("bad_ext_voltage", i64::from(bit_value(w, 8))),
            ("acc", i64::from(bit_value(w, 9))),
            ("critical_vibration", i64::from(bit_value(w, 10))),
            ("sat_glonass_enabled", i64::from(bit_value(w, 11))),
            ("gsm_signal_quality", i64::from(bit_value(w, 12) + 2 * bit_value(w, 13))),
            ("armed", i64::from(bit_value(w, 14))),
            ("sos", i64::from(bit_value(w, 15))),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_tag() {
        let tag = Tag::decode(0x30, b"\x07\xC0\x0E\x32\x03\xB8\xD7\x2D\x05").unwrap();
        match tag.value {
            TagValue::Position { satellites, correctness, latitude, longitude } => {
                assert_eq!(satellites, 7);
                assert_eq!(correctness, 0);
                assert!((latitude - 53.612224).abs() < 1e-9);
                assert!((longitude - 86.890424).abs() < 1e-9);
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_motion_tag() {
        let tag = Tag::decode(0x33, b"\x5C\x00\x48\x08").unwrap();
        assert_eq!(tag.value, TagValue::Motion { speed: 9.2, azimuth: 212.0 });
    }

    #[test]
    fn test_status_word() {
        let tag = Tag::decode(0x40, b"\xAA\xAA").unwrap();
        let TagValue::StatusWord(word) = tag.value else {
            panic!("not a status word");
        };
        let sensors: std::collections::HashMap<_, _> =
            Tag::status_sensors(word).into_iter().collect();
        assert_eq!(sensors["critical_vibration"], 0);
        assert_eq!(sensors["bad_bus_voltage"], 1);
        assert_eq!(sensors["gsm_no_sim_card"], 1);
        assert_eq!(sensors["gsm_signal_quality"], 2);
        assert_eq!(sensors["sos"], 1);
        assert_eq!(sensors["sat_antenna_connected"], 1);
    }

    #[test]
    fn test_temperature_tag() {
        let tag = Tag::decode(0x43, b"\xF5").unwrap();
        assert_eq!(tag.value, TagValue::SInt(-11));
    }

    #[test]
    fn test_acceleration_tag() {
        let tag = Tag::decode(0x44, b"\xAF\x21\x98\x15").unwrap();
        assert_eq!(tag.value, TagValue::Acceleration { x: 431, y: 520, z: 345 });
    }

    #[test]
    fn test_can_tag() {
        let tag = Tag::decode(0xC1, b"\xFA\x72\x50\x25").unwrap();
        match tag.value {
            TagValue::Can { fuel_percent, coolant_temperature, rpm } => {
                assert!((fuel_percent - 100.0).abs() < 1e-9);
                assert_eq!(coolant_temperature, 74);
                assert!((rpm - 1194.0).abs() < 1e-9);
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn test_thermometer_tag() {
        let tag = Tag::decode(0x76, b"\x06\x10").unwrap();
        assert_eq!(tag.value, TagValue::Thermometer { id: 6, temperature: 16 });
    }

    #[test]
    fn test_ibutton_state_tag() {
        let tag = Tag::decode(0xD5, b"\x05").unwrap();
        assert_eq!(tag.value, TagValue::IButtonState(0x05));
    }

    #[test]
    fn test_command_tags_encode() {
        let number = Tag { id: 0xE0, value: TagValue::UInt(1) };
        assert_eq!(number.encode(), b"\xE0\x01\x00\x00\x00");
        let text = Tag { id: 0xE1, value: TagValue::Text("Makephoto 1".into()) };
        assert_eq!(text.encode(), b"\xE1\x0BMakephoto 1");
    }

    #[test]
    fn test_width_table() {
        assert_eq!(tag_width(0x03), Some(TagWidth::Fixed(15)));
        assert_eq!(tag_width(0xE1), Some(TagWidth::Prefixed));
        assert_eq!(tag_width(0x00), Some(TagWidth::Remainder));
        assert_eq!(tag_width(0x5A), None);
    }
}
