//! # Header Sync
//!
//! Block locators for `GetHeaders` requests.

use crate::domain::{Hash, HeaderRecord};
use crate::ports::HeaderIndex;

/// Dense steps before the locator starts doubling.
const LOCATOR_DENSE: usize = 10;

/// Block locator for a `GetHeaders` request, newest first.
///
/// Ten consecutive hashes back from `tip`, then exponentially spaced ones,
/// ending with the oldest header reachable through parent links.
pub fn block_locator(index: &dyn HeaderIndex, tip: &HeaderRecord) -> Vec<Hash> {
    let mut locator = vec![tip.hash];
    let mut step = 1usize;
    let mut cursor = tip.clone();

    'walk: loop {
        for _ in 0..step {
            match index.get(&cursor.previous_hash) {
                Some(parent) => cursor = parent,
                None => break 'walk,
            }
        }
        locator.push(cursor.hash);
        if locator.len() > LOCATOR_DENSE {
            step *= 2;
        }
    }

    if locator.last() != Some(&cursor.hash) {
        locator.push(cursor.hash);
    }
    locator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryHeaderIndex;
    use crate::testing::build_chain;

    #[test]
    fn test_locator_dense_then_sparse() {
        let mut index = MemoryHeaderIndex::new();
        let chain = build_chain(0, 100, 1000, 0x1e00ffff);
        for header in &chain {
            index.insert(header.clone());
        }
        let locator = block_locator(&index, &chain[99]);

        assert_eq!(locator[0], chain[99].hash);
        assert_eq!(locator[10], chain[89].hash);
        assert_eq!(locator[11], chain[87].hash);
        assert_eq!(locator.last(), Some(&chain[0].hash));
        // No duplicates.
        let mut sorted = locator.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), locator.len());
    }

    #[test]
    fn test_locator_single_header() {
        let mut index = MemoryHeaderIndex::new();
        let chain = build_chain(0, 1, 1000, 0x1e00ffff);
        index.insert(chain[0].clone());
        assert_eq!(block_locator(&index, &chain[0]), vec![chain[0].hash]);
    }
}
