//! Fetch configuration and the protocol constants shared across modules.
use crate::dht::DhtServer;
use rand::Rng;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use std::path::PathBuf;

/// Reserved-bits flag advertising BEP 10 extension-protocol support.
pub const EXTENSION_PROTOCOL: u64 = 1 << 20;

/// Frames larger than this terminate a peer connection.
pub const MAX_PACKET_SIZE: usize = 32768;

/// The extended-message id we assign to ut_metadata in our handshake.
pub const UT_METADATA_ID: u8 = 1;

/// Metadata travels in 16 KiB pieces; only the last may be shorter.
pub const METADATA_PIECE_SIZE: usize = 16384;

pub const DHT_PORT: u16 = 6881;

pub const DHT_BOOTSTRAP_NODES: &[SocketAddrV4] = &[
    SocketAddrV4::new(Ipv4Addr::new(82, 221, 103, 244), 6881),
    SocketAddrV4::new(Ipv4Addr::new(67, 215, 246, 10), 6881),
    SocketAddrV4::new(Ipv4Addr::new(212, 129, 33, 59), 6881),
    SocketAddrV4::new(Ipv4Addr::new(87, 98, 162, 88), 6881),
    SocketAddrV4::new(Ipv4Addr::new(174, 129, 43, 152), 6881),
];

/// Well-known open trackers appended when `use_additional_trackers` is on.
pub const DEFAULT_TRACKERS: &[&str] = &[
    "udp://tracker.coppersurfer.tk:6969/announce",
    "udp://tracker.leechers-paradise.org:6969/announce",
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://p4p.arenabg.com:1337/announce",
    "udp://9.rarbg.to:2710/announce",
    "udp://9.rarbg.me:2710/announce",
    "udp://tracker.pomf.se:80/announce",
    "udp://tracker.openbittorrent.com:80/announce",
    "udp://exodus.desync.com:6969/announce",
    "udp://tracker.tiny-vps.com:6969/announce",
    "udp://tracker.moeking.me:6969/announce",
    "udp://retracker.lanta-net.ru:2710/announce",
    "udp://open.stealth.si:80/announce",
    "udp://denis.stalker.upeer.me:6969/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://tracker.cyberia.is:6969/announce",
    "udp://open.demonii.si:1337/announce",
    "udp://ipv4.tracker.harry.lu:80/announce",
    "udp://tracker3.itzmx.com:6961/announce",
    "udp://zephir.monocul.us:6969/announce",
];

/// Everything a [`crate::fetch::Fetcher`] needs beyond the magnet link
/// itself. Passed explicitly; there is no global state.
#[derive(Debug, Clone)]
pub struct Config {
    pub use_trackers: bool,
    pub use_additional_trackers: bool,
    pub dht: Option<DhtServer>,
    pub torrent_cache_folder: Option<PathBuf>,
    pub peer_id: [u8; 20],
    pub bittorrent_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_trackers: true,
            use_additional_trackers: false,
            dht: None,
            torrent_cache_folder: None,
            peer_id: generate_peer_id(),
            bittorrent_port: rand::rng().random_range(10000..60000),
        }
    }
}

/// Generates a 20-byte peer ID: an 8-byte client prefix followed by 12
/// random bytes for uniqueness.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-MF0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_prefix_and_full_length() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], b"-MF0001-");
        assert_eq!(peer_id.len(), 20);
    }

    #[test]
    fn default_port_is_in_unprivileged_range() {
        let config = Config::default();
        assert!((10000..60000).contains(&config.bittorrent_port));
    }
}
