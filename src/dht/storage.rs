//! Expiring storage backing our side of the `get_peers` /
//! `announce_peer` exchange.
use super::node::NodeId;
use crate::torrent::InfoHash;
use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use std::time::Duration;
use std::time::Instant;

const PEER_TTL: Duration = Duration::from_secs(3600);
const TOKEN_TTL: Duration = Duration::from_secs(600);
const MAX_INFO_HASHES: usize = 2000;

/// Peers other nodes have announced to us, grouped by info-hash.
///
/// Entries expire after an hour, and the oldest info-hashes are evicted
/// once more than 2000 are tracked.
#[derive(Debug, Default)]
pub struct PeerStorage {
    data: HashMap<InfoHash, HashMap<SocketAddrV4, Instant>>,
    insertion_order: Vec<InfoHash>,
}

impl PeerStorage {
    pub fn insert_peer(&mut self, info_hash: InfoHash, peer: SocketAddrV4) {
        if !self.data.contains_key(&info_hash) {
            self.insertion_order.push(info_hash);
        }
        self.data.entry(info_hash).or_default().insert(peer, Instant::now());
        self.cull();
        while self.data.len() > MAX_INFO_HASHES {
            let oldest = self.insertion_order.remove(0);
            self.data.remove(&oldest);
        }
    }

    pub fn get_peers(&mut self, info_hash: &InfoHash) -> Vec<SocketAddrV4> {
        self.cull();
        self.data
            .get(info_hash)
            .map(|peers| peers.keys().copied().collect())
            .unwrap_or_default()
    }

    fn cull(&mut self) {
        let now = Instant::now();
        self.data.retain(|_, peers| {
            peers.retain(|_, seen| now.duration_since(*seen) < PEER_TTL);
            !peers.is_empty()
        });
        let data = &self.data;
        self.insertion_order.retain(|hash| data.contains_key(hash));
    }
}

/// Tokens we hand out in `get_peers` replies; an `announce_peer` is only
/// accepted when it returns a token we minted for the same sender, node
/// and info-hash. Tokens are single-use and expire after ten minutes.
#[derive(Debug, Default)]
pub struct TokenStorage {
    data: HashMap<[u8; 16], (Ipv4Addr, NodeId, InfoHash, Instant)>,
}

impl TokenStorage {
    pub fn get_token(&mut self, sender: Ipv4Addr, id: NodeId, info_hash: InfoHash) -> [u8; 16] {
        let mut token = [0u8; 16];
        rand::rng().fill(&mut token[..]);
        self.data.insert(token, (sender, id, info_hash, Instant::now()));
        token
    }

    pub fn verify_token(
        &mut self,
        sender: Ipv4Addr,
        id: NodeId,
        info_hash: InfoHash,
        token: &[u8],
    ) -> bool {
        self.cull();
        let Ok(token) = <[u8; 16]>::try_from(token) else {
            return false;
        };
        match self.data.get(&token) {
            Some((ip, node_id, hash, _)) if (*ip, *node_id, *hash) == (sender, id, info_hash) => {
                self.data.remove(&token);
                true
            }
            _ => false,
        }
    }

    fn cull(&mut self) {
        let now = Instant::now();
        self.data
            .retain(|_, (_, _, _, minted)| now.duration_since(*minted) < TOKEN_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(last_octet: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last_octet), 6881)
    }

    #[test]
    fn stores_and_returns_peers_per_info_hash() {
        let mut storage = PeerStorage::default();
        let hash_a = InfoHash([1u8; 20]);
        let hash_b = InfoHash([2u8; 20]);
        storage.insert_peer(hash_a, peer(1));
        storage.insert_peer(hash_a, peer(2));
        storage.insert_peer(hash_b, peer(3));

        let mut peers = storage.get_peers(&hash_a);
        peers.sort();
        assert_eq!(peers, vec![peer(1), peer(2)]);
        assert_eq!(storage.get_peers(&hash_b), vec![peer(3)]);
        assert!(storage.get_peers(&InfoHash([9u8; 20])).is_empty());
    }

    #[test]
    fn duplicate_peer_insert_is_idempotent() {
        let mut storage = PeerStorage::default();
        let hash = InfoHash([1u8; 20]);
        storage.insert_peer(hash, peer(1));
        storage.insert_peer(hash, peer(1));
        assert_eq!(storage.get_peers(&hash).len(), 1);
    }

    #[test]
    fn tokens_verify_once_for_matching_requester() {
        let mut storage = TokenStorage::default();
        let sender = Ipv4Addr::new(10, 0, 0, 1);
        let id = NodeId([3u8; 20]);
        let hash = InfoHash([4u8; 20]);

        let token = storage.get_token(sender, id, hash);
        assert!(!storage.verify_token(Ipv4Addr::new(10, 0, 0, 2), id, hash, &token));
        assert!(!storage.verify_token(sender, NodeId([5u8; 20]), hash, &token));
        assert!(storage.verify_token(sender, id, hash, &token));
        // single use
        assert!(!storage.verify_token(sender, id, hash, &token));
    }

    #[test]
    fn rejects_malformed_tokens() {
        let mut storage = TokenStorage::default();
        assert!(!storage.verify_token(
            Ipv4Addr::LOCALHOST,
            NodeId([0u8; 20]),
            InfoHash([0u8; 20]),
            b"short",
        ));
    }
}
