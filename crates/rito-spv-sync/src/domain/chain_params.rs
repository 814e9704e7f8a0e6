//! # Chain Parameters
//!
//! Immutable per-network identity and consensus rules: magic number,
//! default port, service bits, DNS seeds, checkpoints and the difficulty
//! rule. Exactly one instance exists per network; share it behind an `Arc`.

use super::errors::SpvError;
use super::invariants::{invariant_checkpoints_ordered, misaligned_checkpoints};
use super::value_objects::{hash_from_hex, Checkpoint};
use serde::{Deserialize, Serialize};

/// Difficulty rule applied to candidate headers.
///
/// Dispatched by [`DifficultyRule::verify`](crate::algorithms::difficulty).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DifficultyRule {
    /// Proof of work, target continuity, and a retarget every
    /// [`RETARGET_INTERVAL`](super::RETARGET_INTERVAL) blocks.
    StandardRetarget,
    /// Accept every header's difficulty. Checkpoints and parent links are
    /// still enforced.
    AlwaysAccept,
}

/// Per-network chain parameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainParams {
    /// Network name, for logs.
    pub name: String,
    /// DNS seed hostnames.
    pub dns_seeds: Vec<String>,
    /// Default P2P port.
    pub standard_port: u16,
    /// Tag prefixed on every wire message.
    pub magic_number: u32,
    /// Service bits this client advertises and requires.
    pub services: u64,
    /// Trusted checkpoints, ascending by height.
    pub checkpoints: Vec<Checkpoint>,
    /// Difficulty rule for this network.
    pub difficulty: DifficultyRule,
    /// Easiest allowed target (compact).
    pub max_target: u32,
}

const GENESIS_HASH: &str = "00000075e344bdf1c0e433f453764b1830a7aa19b2a5213e707502a22b779c1b";

const MAINNET_CHECKPOINTS: [Checkpoint; 2] = [
    Checkpoint::new(0, hash_from_hex(GENESIS_HASH), 1543578342, 0x1e00ffff),
    Checkpoint::new(
        13205,
        hash_from_hex("00000000002d64255013feb75a702864edc57ca4a7dd307dc3c5c41f817f40a4"),
        1544304635,
        0x1b2f6c70,
    ),
];

const TESTNET_CHECKPOINTS: [Checkpoint; 2] = [
    Checkpoint::new(0, hash_from_hex(GENESIS_HASH), 1543578342, 0x1e00ffff),
    Checkpoint::new(
        3500,
        hash_from_hex("000008019f6ea572ce5b9fd9bf406d5bf0bb5109044d4d14275b6b43a77a9e8f"),
        1544283660,
        0x1e0fffff,
    ),
];

impl ChainParams {
    /// Create validated chain parameters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        dns_seeds: Vec<String>,
        standard_port: u16,
        magic_number: u32,
        services: u64,
        checkpoints: Vec<Checkpoint>,
        difficulty: DifficultyRule,
        max_target: u32,
    ) -> Result<Self, SpvError> {
        let params = Self {
            name: name.into(),
            dns_seeds,
            standard_port,
            magic_number,
            services,
            checkpoints,
            difficulty,
            max_target,
        };
        params.validate()?;
        Ok(params)
    }

    /// Main network.
    pub fn mainnet() -> Self {
        Self {
            name: "main".to_string(),
            dns_seeds: vec![
                "s1.ritocoin.org.".to_string(),
                "s2.ritocoin.org.".to_string(),
                "s3.ritocoin.org.".to_string(),
            ],
            standard_port: 7342,
            magic_number: 0xa1c0_7b2a,
            services: 0,
            checkpoints: MAINNET_CHECKPOINTS.to_vec(),
            difficulty: DifficultyRule::StandardRetarget,
            max_target: 0x1e00_ffff,
        }
    }

    /// Test network. Difficulty checks are disabled here.
    pub fn testnet() -> Self {
        Self {
            name: "test".to_string(),
            dns_seeds: vec![
                "tn.s1.ritocoin.org.".to_string(),
                "tn.s2.ritocoin.org.".to_string(),
                "tn.s3.ritocoin.org.".to_string(),
            ],
            standard_port: 17342,
            magic_number: 0x5253_4e51,
            services: 0,
            checkpoints: TESTNET_CHECKPOINTS.to_vec(),
            difficulty: DifficultyRule::AlwaysAccept,
            max_target: 0x1e0f_ffff,
        }
    }

    /// Check structural invariants.
    ///
    /// Checkpoints off a retarget boundary are tolerated but logged.
    pub fn validate(&self) -> Result<(), SpvError> {
        if self.checkpoints.is_empty() {
            return Err(SpvError::InvalidChainParams(format!(
                "network {} has no checkpoints",
                self.name
            )));
        }
        invariant_checkpoints_ordered(&self.checkpoints)?;
        let misaligned = misaligned_checkpoints(&self.checkpoints);
        if !misaligned.is_empty() {
            tracing::warn!(
                network = %self.name,
                heights = ?misaligned,
                "checkpoints off a retarget boundary cannot anchor the next retarget"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_identity() {
        let params = ChainParams::mainnet();
        assert_eq!(params.standard_port, 7342);
        assert_eq!(params.magic_number, 0xa1c07b2a);
        assert_eq!(params.dns_seeds.len(), 3);
        assert_eq!(params.difficulty, DifficultyRule::StandardRetarget);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_testnet_identity() {
        let params = ChainParams::testnet();
        assert_eq!(params.standard_port, 17342);
        assert_eq!(params.magic_number, 0x52534e51);
        assert_eq!(params.difficulty, DifficultyRule::AlwaysAccept);
        assert_eq!(params.checkpoints[1].height, 3500);
    }

    #[test]
    fn test_networks_share_genesis() {
        let main = ChainParams::mainnet();
        let test = ChainParams::testnet();
        assert_eq!(main.checkpoints[0], test.checkpoints[0]);
    }

    #[test]
    fn test_new_rejects_unordered_checkpoints() {
        let checkpoints = vec![
            Checkpoint::new(4032, [1u8; 32], 0, 0x1d00ffff),
            Checkpoint::new(2016, [2u8; 32], 0, 0x1d00ffff),
        ];
        let result = ChainParams::new(
            "bad",
            vec![],
            1,
            1,
            0,
            checkpoints,
            DifficultyRule::StandardRetarget,
            0x1d00ffff,
        );
        assert!(matches!(result, Err(SpvError::InvalidChainParams(_))));
    }

    #[test]
    fn test_new_rejects_empty_checkpoints() {
        let result = ChainParams::new(
            "empty",
            vec![],
            1,
            1,
            0,
            vec![],
            DifficultyRule::AlwaysAccept,
            0x1d00ffff,
        );
        assert!(result.is_err());
    }
}
