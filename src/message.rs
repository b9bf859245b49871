use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Control messages exchanged between nodes. The bincode encoding is
/// tag-carrying, so both sides reconstruct the variant from the byte
/// stream alone; keys are always the hashed form, never cleartext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Announces that an encrypted payload of `size` plaintext bytes is
    /// about to be streamed on this connection.
    StoreFile { key: String, size: i64 },
    /// Asks every peer holding `key` to stream it back.
    GetFile { key: String },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        bincode::serialize(self).map_err(|e| Error::Decode(format!("encode message: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        bincode::deserialize(bytes).map_err(|e| Error::Decode(format!("decode message: {}", e)))
    }
}
