//! BitTorrent peer connections: handshake, BEP 10 extension negotiation
//! and BEP 9 metadata download.
use crate::fetch::TaskRegistry;
use crate::torrent::InfoHash;
use std::net::SocketAddrV4;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing::debug;

pub mod handshake;
pub mod metadata;
#[cfg(test)]
pub mod test_support;

pub use handshake::Handshake;
pub use metadata::MetadataFetcher;

/// TCP connection establishment budget.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(7);

/// Budget for the whole exchange, handshake through verified metadata.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid handshake")]
    InvalidHandshake,

    #[error("Handshake info-hash mismatch")]
    InfoHashMismatch,

    #[error("Peer does not support the extension protocol")]
    ExtensionProtocolUnsupported,

    #[error("Peer does not support ut_metadata")]
    UtMetadataUnsupported,

    #[error("Peer did not report a usable metadata size")]
    UnknownMetadataSize,

    #[error("Frame exceeds the packet size limit")]
    OversizedFrame,

    #[error("Peer rejected our metadata request")]
    MetadataRejected,

    #[error("Metadata does not hash to the requested info-hash")]
    VerificationFailed,
}

/// Connects to one peer and tries to pull the whole `info` dictionary
/// from it.
///
/// Every failure mode (refusal, timeout, protocol violation, hash
/// mismatch) collapses to `None`; the orchestrator just moves on to the
/// next peer. The metadata wait is registered with `registry` so a
/// winning sibling can cut this connection short.
pub async fn fetch_from_peer(
    registry: &TaskRegistry,
    addr: SocketAddrV4,
    info_hash: InfoHash,
    peer_id: [u8; 20],
) -> Option<Vec<u8>> {
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!(%addr, "failed to connect: {err}");
            return None;
        }
        Err(_) => {
            debug!(%addr, "connect timed out");
            return None;
        }
    };

    let registration = registry.register();
    let fetcher = MetadataFetcher::new(stream, info_hash, peer_id, addr);
    tokio::select! {
        _ = registration.cancelled() => {
            debug!(%addr, "peer task cancelled");
            None
        }
        outcome = timeout(METADATA_TIMEOUT, fetcher.run()) => match outcome {
            Ok(Ok(metadata)) => Some(metadata),
            Ok(Err(err)) => {
                debug!(%addr, "metadata exchange failed: {err}");
                None
            }
            Err(_) => {
                debug!(%addr, "metadata exchange timed out");
                None
            }
        },
    }
}
