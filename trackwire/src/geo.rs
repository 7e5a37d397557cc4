//! Coordinate format conversions.
//!
//! All protocols are normalized to signed decimal degrees. The ASCII
//! protocols carry one of:
//! - plain decimal degrees (`53.239133`, `-77.98775`)
//! - degrees + decimal minutes, `DDMM.MMMM`, hemisphere as prefix, suffix
//!   or sign (`N5314.5480`, `09515.739W`, `-3933.3334`)
//! - degrees + minutes + decimal seconds, `DDMMSS.SS`, same hemisphere rules
//! - signed micro-degrees without a decimal point (`+050123456`)
//!
//! Binary protocols use fixed-point integers; those conversions are plain
//! factor functions here so each codec states its scale in one place.

use std::sync::OnceLock;

use regex::Regex;

struct CoordPatterns {
    decimal: Regex,
    dm: Regex,
    dms: Regex,
    micro: Regex,
}

fn patterns(lon: bool) -> &'static CoordPatterns {
    static LAT: OnceLock<CoordPatterns> = OnceLock::new();
    static LON: OnceLock<CoordPatterns> = OnceLock::new();
    let cell = if lon { &LON } else { &LAT };
    cell.get_or_init(|| {
        // latitude degrees are 1-2 digits (DDMM...), longitude 3 digits
        let (deg, hemis) = if lon {
            (r"(?P<deg>[01]?\d\d)", "EW")
        } else {
            (r"(?P<deg>\d\d)", "NS")
        };
        let dir_pre = format!(r"^(?P<pre>[{hemis}])?");
        let dir_post = format!(r"(?P<post>[{hemis}])?$");
        CoordPatterns {
            decimal: Regex::new(r"^(?P<val>-?\d{1,3}(?:\.\d*)?)$").expect("static pattern"),
            dm: Regex::new(&format!(
                r"{dir_pre}(?P<sign>-)?{deg}(?P<min>[0-5]\d\.\d+){dir_post}"
            ))
            .expect("static pattern"),
            dms: Regex::new(&format!(
                r"{dir_pre}(?P<sign>-)?{deg}(?P<min>[0-5]\d)(?P<sec>[0-5]\d(?:\.\d*)?){dir_post}"
            ))
            .expect("static pattern"),
            micro: Regex::new(r"^(?P<sign>[+-])(?P<val>\d{8,10})$").expect("static pattern"),
        }
    })
}

fn parse_coord(value: &str, lon: bool) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let p = patterns(lon);
    let limit = if lon { 180.0 } else { 90.0 };

    if let Some(m) = p.micro.captures(value) {
        let v: f64 = m["val"].parse().ok()?;
        let v = v / 1_000_000.0;
        let v = if &m["sign"] == "-" { -v } else { v };
        return (v.abs() <= limit).then_some(v);
    }
    if let Some(m) = p.decimal.captures(value) {
        let v: f64 = m["val"].parse().ok()?;
        return (v.abs() <= limit).then_some(v);
    }
    for (re, with_seconds) in [(&p.dm, false), (&p.dms, true)] {
        if let Some(m) = re.captures(value) {
            let deg: f64 = m["deg"].parse().ok()?;
            let (minutes, seconds) = if with_seconds {
                (m["min"].parse::<f64>().ok()?, m["sec"].parse::<f64>().ok()?)
            } else {
                (m["min"].parse::<f64>().ok()?, 0.0)
            };
            let mut v = deg + minutes / 60.0 + seconds / 3600.0;
            let dir = m
                .name("pre")
                .or_else(|| m.name("post"))
                .map(|d| d.as_str().to_ascii_uppercase());
            let negative =
                m.name("sign").is_some() || matches!(dir.as_deref(), Some("S") | Some("W"));
            if negative {
                v = -v;
            }
            return (v.abs() <= limit).then_some(v);
        }
    }
    None
}

/// Parse a latitude string in any of the supported formats.
pub fn parse_latitude(value: &str) -> Option<f64> {
    parse_coord(value, false)
}

/// Parse a longitude string in any of the supported formats.
pub fn parse_longitude(value: &str) -> Option<f64> {
    parse_coord(value, true)
}

/// Signed micro-degrees to decimal degrees (Galileo tag 0x30, factor 1e6).
pub fn from_microdegrees(value: i32) -> f64 {
    f64::from(value) / 1_000_000.0
}

/// Signed tenth-micro-degrees to decimal degrees (Teltonika AVL, factor 1e7).
pub fn from_decimicrodegrees(value: i32) -> f64 {
    f64::from(value) / 10_000_000.0
}

/// Naviset coordinate: the 32-bit integer is read as the base-10 decimal
/// `DDMMMMMM` and split after the first two digits, so 53243104 becomes
/// 53.243104. Hemisphere is not encoded in the field.
pub fn from_naviset(value: u32) -> f64 {
    let text = value.to_string();
    if text.len() <= 2 {
        return f64::from(value);
    }
    let (deg, frac) = text.split_at(2);
    format!("{deg}.{frac}").parse().unwrap_or(0.0)
}

/// Knots to km/h.
pub fn knots_to_kmh(knots: f64) -> f64 {
    knots * 1.852
}

/// Miles per hour to km/h.
pub fn mph_to_kmh(mph: f64) -> f64 {
    mph * 1.609_344
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_decimal() {
        assert!(close(parse_latitude("89.399397").unwrap(), 89.399397));
        assert!(close(parse_longitude("-180").unwrap(), -180.0));
        assert!(parse_latitude("91.0").is_none());
    }

    #[test]
    fn test_degrees_minutes() {
        assert!(close(parse_latitude("N5314.5480").unwrap(), 53.0 + 14.548 / 60.0));
        assert!(close(parse_longitude("E05012.6060").unwrap(), 50.0 + 12.606 / 60.0));
        assert!(close(parse_longitude("09515.739W").unwrap(), -(95.0 + 15.739 / 60.0)));
        assert!(close(parse_latitude("-3933.3334").unwrap(), -(39.0 + 33.3334 / 60.0)));
    }

    #[test]
    fn test_degrees_minutes_seconds() {
        assert!(close(
            parse_latitude("385733.804N").unwrap(),
            38.0 + 57.0 / 60.0 + 33.804 / 3600.0
        ));
        assert!(close(
            parse_longitude("E1112201.03").unwrap(),
            111.0 + 22.0 / 60.0 + 1.03 / 3600.0
        ));
    }

    #[test]
    fn test_microdegrees() {
        assert!(close(parse_longitude("+050123456").unwrap(), 50.123456));
        assert!(close(parse_latitude("-53123456").unwrap(), -53.123456));
        assert!(close(from_microdegrees(53_612_224), 53.612224));
        assert!(close(from_decimicrodegrees(253_032_016), 25.3032016));
    }

    #[test]
    fn test_naviset_coordinate() {
        assert!(close(from_naviset(53_243_104), 53.243104));
        assert!(close(from_naviset(50_183_400), 50.1834));
    }

    #[test]
    fn test_speed_conversions() {
        assert!(close(knots_to_kmh(1.0), 1.852));
        assert!(close(mph_to_kmh(1.0), 1.609344));
    }

    #[test]
    fn test_roundtrip_monotone() {
        // decode(encode(x)) identity at format resolution
        for &lat in &[-89.5, -12.25, 0.0, 45.123456, 89.9] {
            let encoded = (lat * 1e6) as i32;
            assert!(close(from_microdegrees(encoded), lat));
        }
    }
}
