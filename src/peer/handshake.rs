//! The BitTorrent peer handshake.
//!
//! The handshake is the first message exchanged between two peers. It
//! verifies that both sides are talking about the same torrent (via the
//! info-hash) and advertises protocol extensions through the reserved
//! bytes; we require bit 20, the BEP 10 extension protocol.
use super::PeerError;
use crate::config::EXTENSION_PROTOCOL;
use crate::torrent::InfoHash;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// A 68-byte BitTorrent handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates our side of the handshake with the extension-protocol bit
    /// set.
    pub fn new(info_hash: &InfoHash, peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        BigEndian::write_u64(&mut reserved, EXTENSION_PROTOCOL);
        Self {
            reserved,
            info_hash: info_hash.0,
            peer_id,
        }
    }

    /// Serializes into the wire layout: length-prefixed protocol string,
    /// reserved bytes, info-hash, peer ID.
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads and validates the peer's handshake from the stream.
    pub async fn read(stream: &mut TcpStream) -> Result<Self, PeerError> {
        let mut length_buf = [0u8; 1];
        stream.read_exact(&mut length_buf).await?;
        if length_buf[0] as usize != PROTOCOL.len() {
            return Err(PeerError::InvalidHandshake);
        }

        let mut buf = [0u8; 67];
        stream.read_exact(&mut buf).await?;
        if &buf[0..19] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[19..27]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[27..47]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn supports_extension_protocol(&self) -> bool {
        BigEndian::read_u64(&self.reserved) & EXTENSION_PROTOCOL != 0
    }

    /// Checks that the peer is serving the torrent we asked about.
    pub fn validate(&self, expected: &InfoHash) -> Result<(), PeerError> {
        if self.info_hash != expected.0 {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }
}
