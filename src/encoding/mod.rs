//! Binary data encodings.
//!
//! - keycode: used for keys in the key/value store.
//! - bincode: used for values in the key/value store and network protocols.
//!
//! The replicated command format is deliberately not in this module: commands
//! use self-describing JSON (see fsm), so that log records remain readable
//! and forward-compatible across versions.

pub mod bincode;
pub mod keycode;

use crate::error::Result;

/// Adds automatic Bincode encode/decode methods to value types. These are
/// used for values in the key/value store and across the network.
pub trait Value: serde::Serialize + serde::de::DeserializeOwned {
    /// Decodes a value from a byte slice using Bincode.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Encodes a value into a byte vector using Bincode.
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self)
    }
}

/// Adds automatic Keycode encode/decode methods to key types. These are used
/// for keys in the key/value store, and preserve the ordering of the encoded
/// type.
pub trait Key<'de>: serde::Serialize + serde::Deserialize<'de> {
    /// Decodes a key from a byte slice using Keycode.
    fn decode(bytes: &'de [u8]) -> Result<Self> {
        keycode::deserialize(bytes)
    }

    /// Encodes a key into a byte vector using Keycode.
    ///
    /// In the common case, the encoded size is known, so errors here are
    /// considered critical and panic.
    fn encode(&self) -> Vec<u8> {
        keycode::serialize(self)
    }
}
