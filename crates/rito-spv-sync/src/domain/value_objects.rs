//! # Domain Value Objects
//!
//! Immutable value types for the SPV peer manager.

use super::entities::HeaderRecord;
use super::errors::{Hash, SpvError};
use serde::{Deserialize, Serialize};

/// Trusted checkpoint: a `(height, hash)` pair accepted a priori, plus the
/// timestamp and target needed to restart sync from it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// Block height of this checkpoint.
    pub height: u32,
    /// Block hash at this height.
    pub hash: Hash,
    /// Block timestamp (unix seconds).
    pub timestamp: u32,
    /// Block target in compact encoding.
    pub target: u32,
}

impl Checkpoint {
    /// Create a checkpoint.
    pub const fn new(height: u32, hash: Hash, timestamp: u32, target: u32) -> Self {
        Self {
            height,
            hash,
            timestamp,
            target,
        }
    }

    /// Create a checkpoint from a 64-digit hex hash.
    pub fn from_hex(
        height: u32,
        hash_hex: &str,
        timestamp: u32,
        target: u32,
    ) -> Result<Self, SpvError> {
        let bytes = hex::decode(hash_hex)
            .map_err(|e| SpvError::InvalidChainParams(format!("checkpoint {height}: {e}")))?;
        let hash: Hash = bytes.try_into().map_err(|_| {
            SpvError::InvalidChainParams(format!("checkpoint {height}: hash must be 32 bytes"))
        })?;
        Ok(Self::new(height, hash, timestamp, target))
    }

    /// Header record standing in for this checkpoint in a header index.
    ///
    /// The parent hash is unknown and left zeroed.
    pub fn to_header(&self) -> HeaderRecord {
        HeaderRecord::new(self.height, self.hash, [0u8; 32], self.timestamp, self.target)
    }
}

/// Aggregate connection status of a peer manager.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectStatus {
    /// Not trying to connect.
    Disconnected,
    /// Connecting, no peer has completed a handshake yet.
    Connecting,
    /// At least one peer connected.
    Connected,
}

/// Decode a 64-digit hex literal at compile time.
pub const fn hash_from_hex(s: &str) -> Hash {
    let bytes = s.as_bytes();
    assert!(bytes.len() == 64, "hash literal must be 64 hex digits");
    let mut out = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        out[i] = (nibble(bytes[2 * i]) << 4) | nibble(bytes[2 * i + 1]);
        i += 1;
    }
    out
}

const fn nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex digit in hash literal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS: &str = "00000075e344bdf1c0e433f453764b1830a7aa19b2a5213e707502a22b779c1b";

    #[test]
    fn test_hash_from_hex_matches_runtime_decode() {
        let cp = Checkpoint::from_hex(0, GENESIS, 1543578342, 0x1e00ffff).unwrap();
        assert_eq!(cp.hash, hash_from_hex(GENESIS));
        assert_eq!(cp.hash[3], 0x75);
        assert_eq!(cp.hash[31], 0x1b);
    }

    #[test]
    fn test_from_hex_rejects_short_hash() {
        let result = Checkpoint::from_hex(0, "00ff", 0, 0);
        assert!(matches!(result, Err(SpvError::InvalidChainParams(_))));
    }

    #[test]
    fn test_from_hex_rejects_bad_digits() {
        let result = Checkpoint::from_hex(0, &"zz".repeat(32), 0, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_checkpoint_to_header() {
        let cp = Checkpoint::new(2016, [7u8; 32], 1000, 0x1d00ffff);
        let header = cp.to_header();
        assert_eq!(header.height, 2016);
        assert_eq!(header.hash, [7u8; 32]);
        assert_eq!(header.previous_hash, [0u8; 32]);
        assert_eq!(header.target, 0x1d00ffff);
    }
}
