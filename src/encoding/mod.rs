//! Binary data encodings.
//!
//! * bincode: used for persisted node metadata (term, vote, membership), log
//!   file records, and config change payloads carried inside log entries.
//!
//! Raft wire messages use their own fixed-layout codec in raft::codec, since
//! peers must agree on the exact byte layout.

pub mod bincode;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Adds automatic Bincode encode/decode methods to value types.
pub trait Value: Serialize + DeserializeOwned {
    /// Decodes a value from a byte slice using Bincode.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Encodes a value to a byte vector using Bincode.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }
}

impl<V: Value> Value for Vec<V> {}
