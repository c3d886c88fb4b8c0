//! BEP 9 metadata exchange over the BEP 10 extension protocol.
//!
//! After the handshakes, the `info` dictionary is pulled piece by piece
//! (16 KiB each), reassembled in index order and only accepted when its
//! SHA-1 matches the magnet's info-hash.
use super::Handshake;
use super::PeerError;
use crate::bencode;
use crate::bencode::BencodeValue;
use crate::bencode::Dict;
use crate::config::MAX_PACKET_SIZE;
use crate::config::METADATA_PIECE_SIZE;
use crate::config::UT_METADATA_ID;
use crate::torrent::InfoHash;
use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;
use tracing::warn;

const MSG_EXTENDED: u8 = 20;
const EXT_HANDSHAKE: u8 = 0;

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

/// Metadata pieces collected so far, keyed by piece index.
#[derive(Debug, Default)]
struct MetadataBuffer {
    pieces: BTreeMap<u64, Vec<u8>>,
}

impl MetadataBuffer {
    fn insert(&mut self, index: u64, data: Vec<u8>) {
        self.pieces.insert(index, data);
    }

    fn received(&self) -> usize {
        self.pieces.values().map(Vec::len).sum()
    }

    /// Concatenates the pieces in ascending index order.
    fn assemble(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.received());
        for piece in self.pieces.into_values() {
            out.extend_from_slice(&piece);
        }
        out
    }
}

/// What the peer told us in its extension handshake.
#[derive(Debug)]
struct ExtensionConfig {
    ut_metadata: u8,
    metadata_size: usize,
}

/// Drives one connection from handshake to verified `info` bytes.
#[derive(Debug)]
pub struct MetadataFetcher {
    stream: TcpStream,
    info_hash: InfoHash,
    peer_id: [u8; 20],
    addr: SocketAddrV4,
}

impl MetadataFetcher {
    pub fn new(
        stream: TcpStream,
        info_hash: InfoHash,
        peer_id: [u8; 20],
        addr: SocketAddrV4,
    ) -> Self {
        Self {
            stream,
            info_hash,
            peer_id,
            addr,
        }
    }

    pub async fn run(mut self) -> Result<Vec<u8>, PeerError> {
        debug!(addr = %self.addr, "connected, sending handshake");
        let ours = Handshake::new(&self.info_hash, self.peer_id);
        self.stream.write_all(&ours.serialize()).await?;

        let theirs = Handshake::read(&mut self.stream).await?;
        if !theirs.supports_extension_protocol() {
            return Err(PeerError::ExtensionProtocolUnsupported);
        }
        theirs.validate(&self.info_hash)?;

        self.send_extension_handshake().await?;

        let mut config: Option<ExtensionConfig> = None;
        let mut buffer = MetadataBuffer::default();
        loop {
            let frame = self.read_frame().await?;
            let [message_id, rest @ ..] = frame.as_slice() else {
                continue; // keep-alive
            };
            if *message_id != MSG_EXTENDED || rest.is_empty() {
                continue;
            }
            let (extended_id, payload) = (rest[0], &rest[1..]);

            if extended_id == EXT_HANDSHAKE {
                let accepted = self.handle_extension_handshake(payload).await?;
                // a re-handshake resets any partial progress
                buffer = MetadataBuffer::default();
                config = Some(accepted);
            } else if extended_id == UT_METADATA_ID {
                let Some(config) = &config else {
                    continue;
                };
                if let Some(metadata) = self.handle_metadata(payload, config, &mut buffer).await? {
                    return Ok(metadata);
                }
            }
        }
    }

    /// Frames are a 4-byte big-endian length followed by that many
    /// bytes. A zero length is a keep-alive; an oversized length is a
    /// protocol violation.
    async fn read_frame(&mut self) -> Result<Vec<u8>, PeerError> {
        let mut length_buf = [0u8; 4];
        self.stream.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;
        if length > MAX_PACKET_SIZE {
            return Err(PeerError::OversizedFrame);
        }
        let mut frame = vec![0u8; length];
        self.stream.read_exact(&mut frame).await?;
        Ok(frame)
    }

    async fn send_extended(&mut self, extended_id: u8, payload: &[u8]) -> Result<(), PeerError> {
        let length = (payload.len() + 2) as u32;
        let mut frame = Vec::with_capacity(payload.len() + 6);
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(MSG_EXTENDED);
        frame.push(extended_id);
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Announces that we speak ut_metadata.
    async fn send_extension_handshake(&mut self) -> Result<(), PeerError> {
        let mut supported = Dict::new();
        supported.insert(b"ut_metadata".to_vec(), (UT_METADATA_ID as i64).into());
        let mut handshake = Dict::new();
        handshake.insert(b"m".to_vec(), BencodeValue::Dict(supported));
        let payload = bencode::encode_to_vec(&BencodeValue::Dict(handshake))?;
        self.send_extended(EXT_HANDSHAKE, &payload).await
    }

    async fn request_piece(&mut self, config: &ExtensionConfig, piece: u64) -> Result<(), PeerError> {
        let mut request = Dict::new();
        request.insert(b"msg_type".to_vec(), MSG_TYPE_REQUEST.into());
        request.insert(b"piece".to_vec(), (piece as i64).into());
        let payload = bencode::encode_to_vec(&BencodeValue::Dict(request))?;
        self.send_extended(config.ut_metadata, &payload).await
    }

    /// Validates the peer's extension handshake and requests the first
    /// piece.
    async fn handle_extension_handshake(
        &mut self,
        payload: &[u8],
    ) -> Result<ExtensionConfig, PeerError> {
        let handshake = bencode::decode_lax(payload)?
            .into_dict()
            .ok_or(PeerError::UtMetadataUnsupported)?;
        let ut_metadata = handshake
            .get(b"m".as_slice())
            .and_then(|v| v.as_dict())
            .and_then(|m| m.get(b"ut_metadata".as_slice()))
            .and_then(|v| v.as_int())
            .and_then(|id| u8::try_from(id).ok())
            .ok_or(PeerError::UtMetadataUnsupported)?;
        let metadata_size = handshake
            .get(b"metadata_size".as_slice())
            .and_then(|v| v.as_int())
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| *size > 0)
            .ok_or(PeerError::UnknownMetadataSize)?;
        debug!(addr = %self.addr, metadata_size, "peer speaks ut_metadata");

        let config = ExtensionConfig {
            ut_metadata,
            metadata_size,
        };
        self.request_piece(&config, 0).await?;
        Ok(config)
    }

    /// Handles one ut_metadata message. Returns the verified metadata
    /// once the final piece lands.
    async fn handle_metadata(
        &mut self,
        payload: &[u8],
        config: &ExtensionConfig,
        buffer: &mut MetadataBuffer,
    ) -> Result<Option<Vec<u8>>, PeerError> {
        let (header, consumed) = bencode::decode_prefix(payload)?;
        let header = header.into_dict().ok_or(PeerError::MetadataRejected)?;
        let msg_type = header
            .get(b"msg_type".as_slice())
            .and_then(|v| v.as_int())
            .unwrap_or(-1);

        match msg_type {
            MSG_TYPE_REJECT => Err(PeerError::MetadataRejected),
            MSG_TYPE_DATA => {
                let piece = header
                    .get(b"piece".as_slice())
                    .and_then(|v| v.as_int())
                    .and_then(|p| u64::try_from(p).ok())
                    .ok_or(PeerError::MetadataRejected)?;
                let data = payload[consumed..].to_vec();
                if data.len() > METADATA_PIECE_SIZE {
                    return Err(PeerError::OversizedFrame);
                }
                buffer.insert(piece, data);

                if buffer.received() < config.metadata_size {
                    self.request_piece(config, piece + 1).await?;
                    return Ok(None);
                }

                let metadata = std::mem::take(buffer).assemble();
                if InfoHash::of_bencoded(&metadata) == self.info_hash {
                    Ok(Some(metadata))
                } else {
                    warn!(
                        addr = %self.addr,
                        expected = %self.info_hash,
                        got = %InfoHash::of_bencoded(&metadata),
                        "metadata failed verification"
                    );
                    Err(PeerError::VerificationFailed)
                }
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::fake_info;
    use super::super::test_support::spawn_seeder;
    use super::super::test_support::SeederMode;
    use super::*;

    async fn run_fetcher(addr: SocketAddrV4, info_hash: InfoHash) -> Result<Vec<u8>, PeerError> {
        let stream = TcpStream::connect(addr).await.unwrap();
        MetadataFetcher::new(stream, info_hash, [7u8; 20], addr)
            .run()
            .await
    }

    #[tokio::test]
    async fn fetches_single_piece_metadata() {
        let metadata = fake_info(900);
        let (addr, hash, _) = spawn_seeder(metadata.clone(), SeederMode::Serve).await;
        let fetched = run_fetcher(addr, hash).await.unwrap();
        assert_eq!(fetched, metadata);
    }

    #[tokio::test]
    async fn fetches_multi_piece_metadata() {
        let metadata = fake_info(METADATA_PIECE_SIZE * 2 + 500);
        let (addr, hash, _) = spawn_seeder(metadata.clone(), SeederMode::Serve).await;
        let fetched = run_fetcher(addr, hash).await.unwrap();
        assert_eq!(fetched, metadata);
    }

    #[tokio::test]
    async fn discards_metadata_with_wrong_hash() {
        let metadata = fake_info(600);
        let (addr, hash, _) = spawn_seeder(metadata, SeederMode::WrongHash).await;
        assert!(matches!(
            run_fetcher(addr, hash).await,
            Err(PeerError::VerificationFailed)
        ));
    }

    #[tokio::test]
    async fn closes_on_metadata_reject() {
        let metadata = fake_info(600);
        let (addr, hash, _) = spawn_seeder(metadata, SeederMode::Reject).await;
        assert!(matches!(
            run_fetcher(addr, hash).await,
            Err(PeerError::MetadataRejected)
        ));
    }

    #[tokio::test]
    async fn requires_extension_protocol_bit() {
        let metadata = fake_info(600);
        let (addr, hash, _) = spawn_seeder(metadata, SeederMode::NoExtensionBit).await;
        assert!(matches!(
            run_fetcher(addr, hash).await,
            Err(PeerError::ExtensionProtocolUnsupported)
        ));
    }

    #[tokio::test]
    async fn fetch_from_peer_returns_verified_bytes() {
        let metadata = fake_info(1200);
        let (addr, hash, _) = spawn_seeder(metadata.clone(), SeederMode::Serve).await;
        let registry = crate::fetch::TaskRegistry::default();
        let fetched = super::super::fetch_from_peer(&registry, addr, hash, [7u8; 20]).await;
        assert_eq!(fetched, Some(metadata));
        assert!(registry.is_empty());
    }
}
