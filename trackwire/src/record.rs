//! Normalized telemetry record — the single interchange format published
//! to the broker.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sensor reading. The sensors map is open: digital I/O, analog inputs,
/// temperatures, fuel, CAN signals, voltages, iButton ids and so on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for SensorValue {
    fn from(v: i64) -> Self {
        SensorValue::Int(v)
    }
}

impl From<u8> for SensorValue {
    fn from(v: u8) -> Self {
        SensorValue::Int(i64::from(v))
    }
}

impl From<f64> for SensorValue {
    fn from(v: f64) -> Self {
        SensorValue::Float(v)
    }
}

impl From<&str> for SensorValue {
    fn from(v: &str) -> Self {
        SensorValue::Text(v.to_string())
    }
}

/// Normalized record emitted to the broker.
///
/// `time` is UTC; the wire rendering is ISO-8601 with microseconds. Position
/// fields are optional because several packet kinds carry only sensors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    #[serde(default)]
    pub uid: String,
    #[serde(with = "iso_micros")]
    pub time: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// km/h
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// degrees, 0-360
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azimuth: Option<f64>,
    #[serde(rename = "satellitescount", skip_serializing_if = "Option::is_none")]
    pub satellites: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdop: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sensors: BTreeMap<String, SensorValue>,
}

mod iso_micros {
    use super::*;
    use serde::{Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

    pub fn serialize<S: Serializer>(time: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&text, FORMAT).map_err(serde::de::Error::custom)
    }
}

impl TelemetryRecord {
    pub fn at(time: NaiveDateTime) -> Self {
        Self {
            time,
            ..Self::default()
        }
    }

    pub fn set_sensor(&mut self, name: &str, value: impl Into<SensorValue>) {
        self.sensors.insert(name.to_string(), value.into());
    }

    pub fn sensor(&self, name: &str) -> Option<&SensorValue> {
        self.sensors.get(name)
    }

    /// Mirror the positional fields into the sensors map, the way every
    /// record leaves the gateway.
    pub fn mirror_position_into_sensors(&mut self) {
        if let Some(v) = self.latitude {
            self.set_sensor("latitude", v);
        }
        if let Some(v) = self.longitude {
            self.set_sensor("longitude", v);
        }
        if let Some(v) = self.altitude {
            self.set_sensor("altitude", v);
        }
        if let Some(v) = self.speed {
            self.set_sensor("speed", v);
        }
        if let Some(v) = self.hdop {
            self.set_sensor("hdop", v);
        }
        if let Some(v) = self.azimuth {
            self.set_sensor("azimuth", v);
        }
        if let Some(v) = self.satellites {
            self.set_sensor("sat_count", i64::from(v));
        }
    }

    /// Timestamp of `time` as seconds since the epoch (UTC).
    pub fn epoch_seconds(&self) -> i64 {
        DateTime::<Utc>::from_naive_utc_and_offset(self.time, Utc).timestamp()
    }
}

/// Image payload published alongside telemetry once reassembly completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub uid: String,
    #[serde(with = "iso_micros")]
    pub time: NaiveDateTime,
    pub images: Vec<ImagePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePart {
    pub mime: String,
    /// base64-encoded image bytes
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2011, 7, 5)
            .unwrap()
            .and_hms_opt(14, 33, 14)
            .unwrap()
    }

    #[test]
    fn test_time_format_has_microseconds() {
        let mut record = TelemetryRecord::at(sample_time());
        record.uid = "357460032240926".into();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["time"], "2011-07-05T14:33:14.000000");
        assert_eq!(json["uid"], "357460032240926");
    }

    #[test]
    fn test_optional_fields_skipped() {
        let record = TelemetryRecord::at(sample_time());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("latitude").is_none());
        assert!(json.get("sensors").is_none());
    }

    #[test]
    fn test_mirror_position() {
        let mut record = TelemetryRecord::at(sample_time());
        record.latitude = Some(53.24);
        record.speed = Some(12.5);
        record.satellites = Some(6);
        record.mirror_position_into_sensors();
        assert_eq!(record.sensor("latitude"), Some(&SensorValue::Float(53.24)));
        assert_eq!(record.sensor("sat_count"), Some(&SensorValue::Int(6)));
        assert!(record.sensor("longitude").is_none());
    }

    #[test]
    fn test_satellitescount_key() {
        let mut record = TelemetryRecord::at(sample_time());
        record.satellites = Some(16);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["satellitescount"], 16);
    }
}
