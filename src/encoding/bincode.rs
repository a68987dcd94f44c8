//! Bincode is used to encode persisted metadata, such as the current term and
//! vote or the membership config. It is a Rust-specific encoding that depends
//! on the internal data structures being stable, which is fine for local
//! files. See: https://github.com/bincode-org/bincode
//!
//! This module wraps the standard bincode crate to always use DefaultOptions,
//! i.e. variable-length rather than fixed-length integers. Upstream
//! bincode::(de)serialize confusingly uses fixed-length integers.

use crate::error::Result;

use bincode::Options;

/// Returns the default Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// Serializes a value using Bincode.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode().serialize(value)?)
}
