//! # Peer Pool
//!
//! Known peers, their connection states, and download peer selection.
//!
//! Every state change goes through [`PeerPool::transition`], which enforces
//! the [`ConnectionState`] machine.

use super::entities::{ConnectionState, Peer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use tracing::debug;

/// Peer set owned by the manager's worker.
#[derive(Debug, Default)]
pub struct PeerPool {
    /// Known peers by address.
    known: BTreeMap<SocketAddr, Peer>,
    /// Start height advertised in each connected peer's handshake.
    heights: HashMap<SocketAddr, u32>,
    /// Misbehaving peers and the unix time their ban ends.
    banned_until: HashMap<SocketAddr, u64>,
    /// Connected peers that served nothing below their advertised height.
    /// Skipped by download peer selection until they announce a new block
    /// or reconnect.
    stalled: HashSet<SocketAddr>,
    /// Discovery override.
    fixed_peer: Option<SocketAddr>,
    /// Current download peer.
    download_peer: Option<SocketAddr>,
}

impl PeerPool {
    /// Create a pool from persisted peers. All start disconnected.
    pub fn new(peers: Vec<Peer>) -> Self {
        let known = peers
            .into_iter()
            .map(|mut peer| {
                peer.state = ConnectionState::Disconnected;
                (peer.socket_addr(), peer)
            })
            .collect();
        Self {
            known,
            ..Self::default()
        }
    }

    /// Add newly discovered peers. Returns those that were not already known.
    pub fn learn(&mut self, peers: impl IntoIterator<Item = Peer>, now: u64) -> Vec<Peer> {
        let mut added = Vec::new();
        for mut peer in peers {
            let addr = peer.socket_addr();
            if self.is_banned(&addr, now) {
                continue;
            }
            if let Some(existing) = self.known.get_mut(&addr) {
                existing.timestamp = existing.timestamp.max(peer.timestamp);
                continue;
            }
            peer.state = ConnectionState::Disconnected;
            added.push(peer.clone());
            self.known.insert(addr, peer);
        }
        added
    }

    /// Set or clear the discovery override.
    pub fn set_fixed_peer(&mut self, addr: Option<SocketAddr>) {
        self.fixed_peer = addr;
    }

    /// Discovery override, if any.
    pub fn fixed_peer(&self) -> Option<SocketAddr> {
        self.fixed_peer
    }

    /// Up to `limit` disconnected, unbanned peers to dial, most recently
    /// seen first. With a fixed peer set, only that peer.
    pub fn candidates(&mut self, limit: usize, now: u64) -> Vec<SocketAddr> {
        if let Some(fixed) = self.fixed_peer {
            let peer = self
                .known
                .entry(fixed)
                .or_insert_with(|| Peer::from_socket(fixed, now));
            return if peer.state == ConnectionState::Disconnected && limit > 0 {
                vec![fixed]
            } else {
                Vec::new()
            };
        }

        let mut idle: Vec<&Peer> = self
            .known
            .values()
            .filter(|p| p.state == ConnectionState::Disconnected)
            .filter(|p| !self.is_banned(&p.socket_addr(), now))
            .collect();
        idle.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        idle.into_iter().take(limit).map(Peer::socket_addr).collect()
    }

    /// Apply a state transition. Returns `false` (and changes nothing) when
    /// the peer is unknown or the transition is illegal.
    pub fn transition(&mut self, addr: &SocketAddr, next: ConnectionState) -> bool {
        let Some(peer) = self.known.get_mut(addr) else {
            debug!(peer = %addr, ?next, "transition on unknown peer");
            return false;
        };
        if !peer.state.can_transition_to(next) {
            debug!(peer = %addr, from = ?peer.state, to = ?next, "illegal peer transition");
            return false;
        }
        peer.state = next;
        if !next.is_connected() {
            self.heights.remove(addr);
            self.stalled.remove(addr);
            if self.download_peer == Some(*addr) {
                self.download_peer = None;
            }
        }
        true
    }

    /// Record a completed handshake.
    pub fn mark_connected(
        &mut self,
        addr: &SocketAddr,
        services: u64,
        start_height: u32,
        now: u64,
    ) -> bool {
        if !self.transition(addr, ConnectionState::Connected) {
            return false;
        }
        if let Some(peer) = self.known.get_mut(addr) {
            peer.services = services;
            peer.timestamp = now;
        }
        self.heights.insert(*addr, start_height);
        true
    }

    /// Raise a connected peer's advertised height. A higher announcement
    /// lifts a stall.
    pub fn observe_height(&mut self, addr: &SocketAddr, height: u32) {
        if let Some(h) = self.heights.get_mut(addr) {
            if height > *h {
                *h = height;
                self.stalled.remove(addr);
            }
        }
    }

    /// Demote the download peer after it served nothing while behind its
    /// own advertised height: back to `Connected`, excluded from selection.
    pub fn mark_stalled(&mut self, addr: &SocketAddr) -> bool {
        if self.download_peer != Some(*addr)
            || !self.transition(addr, ConnectionState::Connected)
        {
            return false;
        }
        self.download_peer = None;
        self.stalled.insert(*addr);
        true
    }

    /// Whether `addr` is excluded from selection as stalled.
    pub fn is_stalled(&self, addr: &SocketAddr) -> bool {
        self.stalled.contains(addr)
    }

    /// Forget every stall (rescan starts over).
    pub fn clear_stalls(&mut self) {
        self.stalled.clear();
    }

    /// Mark a peer disconnected (from any live state).
    pub fn mark_disconnected(&mut self, addr: &SocketAddr) -> bool {
        if self.state(addr) == Some(ConnectionState::Disconnected) {
            return false;
        }
        self.transition(addr, ConnectionState::Disconnected)
    }

    /// Demote a peer for a protocol violation: ban it, drop it from the
    /// known set. Returns the removed peer.
    pub fn mark_misbehaving(&mut self, addr: &SocketAddr, now: u64, ban_secs: u64) -> Option<Peer> {
        if self.transition(addr, ConnectionState::Misbehaving) {
            self.transition(addr, ConnectionState::Disconnected);
        }
        self.banned_until.insert(*addr, now.saturating_add(ban_secs));
        self.remove(addr)
    }

    /// Forget a peer entirely.
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Peer> {
        self.heights.remove(addr);
        self.stalled.remove(addr);
        if self.download_peer == Some(*addr) {
            self.download_peer = None;
        }
        self.known.remove(addr)
    }

    /// Whether `addr` is serving a misbehaviour ban at `now`.
    pub fn is_banned(&self, addr: &SocketAddr, now: u64) -> bool {
        self.banned_until.get(addr).is_some_and(|until| *until > now)
    }

    /// Choose the download peer: highest advertised height, then most
    /// service bits, among connected peers that are neither banned nor
    /// stalled. The chosen peer moves to `Syncing`.
    pub fn select_download_peer(&mut self, now: u64) -> Option<SocketAddr> {
        if let Some(current) = self.download_peer {
            if self.state(&current) == Some(ConnectionState::Syncing) {
                return Some(current);
            }
            self.download_peer = None;
        }

        let best = self
            .known
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .filter(|p| !self.is_banned(&p.socket_addr(), now))
            .filter(|p| !self.stalled.contains(&p.socket_addr()))
            .max_by_key(|p| {
                let addr = p.socket_addr();
                let height = self.heights.get(&addr).copied().unwrap_or(0);
                (height, p.services.count_ones())
            })
            .map(Peer::socket_addr)?;

        if self.transition(&best, ConnectionState::Syncing) {
            self.download_peer = Some(best);
        }
        self.download_peer
    }

    /// Current download peer.
    pub fn download_peer(&self) -> Option<SocketAddr> {
        self.download_peer
    }

    /// Reset every peer to `Disconnected` and clear the download peer.
    pub fn disconnect_all(&mut self) {
        for peer in self.known.values_mut() {
            peer.state = ConnectionState::Disconnected;
        }
        self.heights.clear();
        self.stalled.clear();
        self.download_peer = None;
    }

    /// Connection state of a peer.
    pub fn state(&self, addr: &SocketAddr) -> Option<ConnectionState> {
        self.known.get(addr).map(|p| p.state)
    }

    /// Peers that completed a handshake.
    pub fn connected(&self) -> Vec<SocketAddr> {
        self.known
            .values()
            .filter(|p| p.state.is_connected())
            .map(Peer::socket_addr)
            .collect()
    }

    /// Number of peers that completed a handshake.
    pub fn connected_count(&self) -> usize {
        self.known.values().filter(|p| p.state.is_connected()).count()
    }

    /// Connecting or connected peers.
    pub fn active_count(&self) -> usize {
        self.known
            .values()
            .filter(|p| p.state != ConnectionState::Disconnected)
            .count()
    }

    /// Best advertised height among connected peers.
    pub fn best_height(&self) -> Option<u32> {
        self.heights.values().copied().max()
    }

    /// Best advertised height among connected peers that are not stalled.
    pub fn best_serving_height(&self) -> Option<u32> {
        self.heights
            .iter()
            .filter(|(addr, _)| !self.stalled.contains(*addr))
            .map(|(_, height)| *height)
            .max()
    }

    /// Snapshot of every known peer.
    pub fn known_peers(&self) -> Vec<Peer> {
        self.known.values().cloned().collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 7342)
    }

    fn peer(n: u8, seen: u64) -> Peer {
        Peer::from_socket(addr(n), seen)
    }

    fn connect(pool: &mut PeerPool, n: u8, services: u64, height: u32) {
        assert!(pool.transition(&addr(n), ConnectionState::Connecting));
        assert!(pool.mark_connected(&addr(n), services, height, 100));
    }

    #[test]
    fn test_learn_reports_only_new() {
        let mut pool = PeerPool::new(vec![peer(1, 10)]);
        let added = pool.learn(vec![peer(1, 20), peer(2, 20)], 100);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].socket_addr(), addr(2));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_candidates_most_recent_first() {
        let mut pool = PeerPool::new(vec![peer(1, 10), peer(2, 30), peer(3, 20)]);
        assert_eq!(pool.candidates(2, 100), vec![addr(2), addr(3)]);
    }

    #[test]
    fn test_candidates_fixed_peer_only() {
        let mut pool = PeerPool::new(vec![peer(1, 10), peer(2, 30)]);
        pool.set_fixed_peer(Some(addr(9)));
        assert_eq!(pool.candidates(3, 100), vec![addr(9)]);

        assert!(pool.transition(&addr(9), ConnectionState::Connecting));
        assert!(pool.candidates(3, 100).is_empty());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut pool = PeerPool::new(vec![peer(1, 10)]);
        assert!(!pool.transition(&addr(1), ConnectionState::Syncing));
        assert_eq!(pool.state(&addr(1)), Some(ConnectionState::Disconnected));
        assert!(!pool.transition(&addr(7), ConnectionState::Connecting));
    }

    #[test]
    fn test_select_prefers_height_then_services() {
        let mut pool = PeerPool::new(vec![peer(1, 0), peer(2, 0), peer(3, 0)]);
        connect(&mut pool, 1, 0b1, 500);
        connect(&mut pool, 2, 0b111, 500);
        connect(&mut pool, 3, 0b1111, 400);

        assert_eq!(pool.select_download_peer(100), Some(addr(2)));
        assert_eq!(pool.state(&addr(2)), Some(ConnectionState::Syncing));
        // Selection is sticky while the peer is syncing.
        assert_eq!(pool.select_download_peer(100), Some(addr(2)));
    }

    #[test]
    fn test_misbehaving_peer_is_banned_and_pruned() {
        let mut pool = PeerPool::new(vec![peer(1, 0), peer(2, 0)]);
        connect(&mut pool, 1, 0, 900);
        connect(&mut pool, 2, 0, 100);
        assert_eq!(pool.select_download_peer(100), Some(addr(1)));

        let removed = pool.mark_misbehaving(&addr(1), 100, 60);
        assert!(removed.is_some());
        assert_eq!(pool.download_peer(), None);
        assert!(pool.is_banned(&addr(1), 159));
        assert!(!pool.is_banned(&addr(1), 160));

        // Re-learning during the ban is ignored.
        assert!(pool.learn(vec![peer(1, 200)], 120).is_empty());
        assert_eq!(pool.select_download_peer(100), Some(addr(2)));
    }

    #[test]
    fn test_stalled_peer_skipped_until_it_announces() {
        let mut pool = PeerPool::new(vec![peer(1, 0), peer(2, 0)]);
        connect(&mut pool, 1, 0b111, 100);
        connect(&mut pool, 2, 0b1, 40);
        assert_eq!(pool.select_download_peer(100), Some(addr(1)));

        assert!(pool.mark_stalled(&addr(1)));
        assert!(!pool.mark_stalled(&addr(1)));
        assert_eq!(pool.state(&addr(1)), Some(ConnectionState::Connected));
        assert!(pool.is_stalled(&addr(1)));
        assert_eq!(pool.best_height(), Some(100));
        assert_eq!(pool.best_serving_height(), Some(40));
        assert_eq!(pool.select_download_peer(100), Some(addr(2)));

        // Announcing the height it already claimed changes nothing.
        pool.observe_height(&addr(1), 100);
        assert!(pool.is_stalled(&addr(1)));
        pool.observe_height(&addr(1), 101);
        assert!(!pool.is_stalled(&addr(1)));
    }

    #[test]
    fn test_stall_lifted_on_disconnect() {
        let mut pool = PeerPool::new(vec![peer(1, 0)]);
        connect(&mut pool, 1, 0, 100);
        pool.select_download_peer(100);
        assert!(pool.mark_stalled(&addr(1)));

        assert!(pool.mark_disconnected(&addr(1)));
        assert!(!pool.is_stalled(&addr(1)));
        connect(&mut pool, 1, 0, 100);
        assert_eq!(pool.select_download_peer(100), Some(addr(1)));
    }

    #[test]
    fn test_download_loss_clears_selection() {
        let mut pool = PeerPool::new(vec![peer(1, 0), peer(2, 0)]);
        connect(&mut pool, 1, 0, 900);
        connect(&mut pool, 2, 0, 800);
        pool.select_download_peer(100);

        assert!(pool.mark_disconnected(&addr(1)));
        assert_eq!(pool.download_peer(), None);
        assert_eq!(pool.connected_count(), 1);
        assert_eq!(pool.select_download_peer(100), Some(addr(2)));
    }

    #[test]
    fn test_disconnect_all() {
        let mut pool = PeerPool::new(vec![peer(1, 0), peer(2, 0)]);
        connect(&mut pool, 1, 0, 900);
        assert!(pool.transition(&addr(2), ConnectionState::Connecting));
        pool.select_download_peer(100);

        pool.disconnect_all();
        assert_eq!(pool.connected_count(), 0);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.download_peer(), None);
        assert_eq!(pool.best_height(), None);
        assert_eq!(pool.len(), 2);
    }
}
