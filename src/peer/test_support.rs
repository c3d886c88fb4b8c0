//! An in-process peer that seeds metadata over ut_metadata, for tests.
use crate::bencode;
use crate::bencode::BencodeValue;
use crate::bencode::Dict;
use crate::config::EXTENSION_PROTOCOL;
use crate::config::METADATA_PIECE_SIZE;
use crate::config::UT_METADATA_ID;
use crate::torrent::InfoHash;
use byteorder::BigEndian;
use byteorder::ByteOrder;
use std::net::SocketAddrV4;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

const MSG_EXTENDED: u8 = 20;
const EXT_HANDSHAKE: u8 = 0;
const SEEDER_UT_METADATA: u8 = 3;

#[derive(Clone, Copy)]
pub enum SeederMode {
    Serve,
    Reject,
    NoExtensionBit,
    WrongHash,
}

/// A bencoded dict roughly `size` bytes long, to stand in for an `info`
/// dictionary.
pub fn fake_info(size: usize) -> Vec<u8> {
    let mut value = Dict::new();
    value.insert(b"p".to_vec(), vec![b'x'; size.saturating_sub(20)].into());
    bencode::encode_to_vec(&BencodeValue::Dict(value)).unwrap()
}

/// Spawns a mock peer serving `metadata`. Returns its address, the
/// info-hash it declares in its handshake, and a counter of accepted
/// connections.
pub async fn spawn_seeder(
    metadata: Vec<u8>,
    mode: SeederMode,
) -> (SocketAddrV4, InfoHash, Arc<AtomicUsize>) {
    let declared_hash = match mode {
        // claim a hash the payload will not satisfy
        SeederMode::WrongHash => InfoHash([0x42u8; 20]),
        _ => InfoHash::of_bencoded(&metadata),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = match listener.local_addr().unwrap() {
        std::net::SocketAddr::V4(addr) => addr,
        _ => unreachable!(),
    };
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = serve_connection(stream, &metadata, declared_hash, mode).await;
        }
    });

    (addr, declared_hash, connections)
}

async fn serve_connection(
    mut stream: TcpStream,
    metadata: &[u8],
    declared_hash: InfoHash,
    mode: SeederMode,
) -> std::io::Result<()> {
    let mut their_handshake = [0u8; 68];
    stream.read_exact(&mut their_handshake).await?;

    let mut reserved = [0u8; 8];
    if !matches!(mode, SeederMode::NoExtensionBit) {
        BigEndian::write_u64(&mut reserved, EXTENSION_PROTOCOL);
    }
    let mut handshake = vec![19u8];
    handshake.extend_from_slice(b"BitTorrent protocol");
    handshake.extend_from_slice(&reserved);
    handshake.extend_from_slice(declared_hash.as_bytes());
    handshake.extend_from_slice(&[1u8; 20]);
    stream.write_all(&handshake).await?;

    loop {
        let mut length_buf = [0u8; 4];
        stream.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;
        let mut frame = vec![0u8; length];
        stream.read_exact(&mut frame).await?;
        if frame.len() < 2 || frame[0] != MSG_EXTENDED {
            continue;
        }

        if frame[1] == EXT_HANDSHAKE {
            let mut m = Dict::new();
            m.insert(b"ut_metadata".to_vec(), (SEEDER_UT_METADATA as i64).into());
            let mut reply = Dict::new();
            reply.insert(b"m".to_vec(), BencodeValue::Dict(m));
            reply.insert(b"metadata_size".to_vec(), (metadata.len() as i64).into());
            let payload = bencode::encode_to_vec(&BencodeValue::Dict(reply)).unwrap();
            send_extended(&mut stream, EXT_HANDSHAKE, &payload).await?;
            continue;
        }

        // a request for a metadata piece
        let request = bencode::decode_lax(&frame[2..])
            .unwrap()
            .into_dict()
            .unwrap();
        let piece = request[b"piece".as_slice()].as_int().unwrap() as usize;

        if matches!(mode, SeederMode::Reject) {
            let mut reject = Dict::new();
            reject.insert(b"msg_type".to_vec(), 2i64.into());
            reject.insert(b"piece".to_vec(), (piece as i64).into());
            let payload = bencode::encode_to_vec(&BencodeValue::Dict(reject)).unwrap();
            send_extended(&mut stream, UT_METADATA_ID, &payload).await?;
            continue;
        }

        let start = piece * METADATA_PIECE_SIZE;
        let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
        let mut header = Dict::new();
        header.insert(b"msg_type".to_vec(), 1i64.into());
        header.insert(b"piece".to_vec(), (piece as i64).into());
        header.insert(b"total_size".to_vec(), (metadata.len() as i64).into());
        let mut payload = bencode::encode_to_vec(&BencodeValue::Dict(header)).unwrap();
        payload.extend_from_slice(&metadata[start..end]);
        send_extended(&mut stream, UT_METADATA_ID, &payload).await?;
    }
}

async fn send_extended(
    stream: &mut TcpStream,
    extended_id: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut frame = ((payload.len() + 2) as u32).to_be_bytes().to_vec();
    frame.push(MSG_EXTENDED);
    frame.push(extended_id);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await
}
