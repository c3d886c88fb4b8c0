//! Tracker client logic for the BitTorrent protocol.
//!
//! Trackers are asked once per fetch (`event=started`) and their compact
//! peer lists feed the orchestrator. A tracker that fails, times out or
//! speaks an unknown scheme simply contributes zero peers.
use crate::fetch::TaskRegistry;
use crate::torrent::InfoHash;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use tracing::warn;
use url::Url;

pub mod http;
pub mod udp;

/// Contains the parsed response of a tracker announce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerResponse {
    pub seeders: i64,
    pub leechers: i64,
    pub peers: Vec<SocketAddrV4>,
}

impl TrackerResponse {
    /// What a failed or empty source reports.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Announces to one tracker, dispatching on the URL scheme.
pub async fn announce(
    registry: &TaskRegistry,
    tracker: &str,
    info_hash: &InfoHash,
    peer_id: &[u8; 20],
    port: u16,
) -> TrackerResponse {
    let Ok(url) = Url::parse(tracker) else {
        warn!(tracker, "unparseable tracker URL");
        return TrackerResponse::empty();
    };
    match url.scheme() {
        "http" | "https" => http::announce(registry, tracker, info_hash, peer_id, port).await,
        "udp" => {
            let (Some(host), Some(udp_port)) = (url.host_str(), url.port()) else {
                warn!(tracker, "udp tracker URL without host:port");
                return TrackerResponse::empty();
            };
            udp::announce(registry, host, udp_port, info_hash, peer_id).await
        }
        other => {
            warn!(tracker, scheme = other, "unknown tracker scheme");
            TrackerResponse::empty()
        }
    }
}

/// Parses a packed sequence of 6-byte `(IPv4, port)` records; a trailing
/// fragment is ignored.
pub fn parse_compact_peers(blob: &[u8]) -> Vec<SocketAddrV4> {
    blob.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect()
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// Unreserved characters pass through; everything else (notably the raw
/// info-hash bytes) becomes `%XX`.
pub(crate) fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}
