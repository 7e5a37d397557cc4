//! Wire codecs for GPS/telematics tracker protocols.
//!
//! One codec per firmware family. Every codec frames the raw TCP byte
//! stream into protocol packets, translates them into normalized telemetry
//! records, produces the acknowledgement bytes the device expects, and
//! encodes server-to-device commands (TCP frames or SMS parts).
//!
//! Layering, leaves first:
//! - [`checksum`] / [`bits`] — XOR-LRC, CRC-16 variants, bit-field helpers
//! - [`frame`] — byte cursor and stream reframing shared by binary codecs
//! - [`geo`] — coordinate format conversions
//! - [`record`] — the normalized record emitted to the broker
//! - [`command`] — server-to-device command model
//! - [`codec`] / [`registry`] — the capability trait and the alias table
//! - protocol modules — `globalsat`, `naviset`, `teltonika`, `autolink`,
//!   `atrack`, `galileo`, `ime`

pub mod bits;
pub mod checksum;
pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod geo;
pub mod record;
pub mod registry;

pub mod atrack;
pub mod autolink;
pub mod galileo;
pub mod globalsat;
pub mod ime;
pub mod naviset;
pub mod teltonika;

pub use codec::{Codec, CodecConfig, DataPayload, ImageEvent, Packet, PacketKind, ParseOutput};
pub use command::{CommandData, DeviceCommand, InitiationConfig, SmsPart, Transport};
pub use error::{CodecError, Result};
pub use record::{SensorValue, TelemetryRecord};
pub use registry::Registry;
