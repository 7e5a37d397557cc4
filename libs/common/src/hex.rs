//! Hex formatting helpers for raw packet logging

use std::fmt::Write;

/// Encode bytes to an uppercase hex string.
/// Example: `[0x12, 0x34, 0xAB]` -> `"1234AB"`
pub fn encode_upper(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        // writing into a String cannot fail
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Encode bytes as space-separated hex pairs for debug output.
/// Example: `[0x12, 0x34, 0xAB]` -> `"12 34 AB"`
pub fn format_pretty(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}
