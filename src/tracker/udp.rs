//! UDP tracker announce (BEP 15): a connect round-trip to obtain a
//! connection ID, then the announce proper.
use super::TrackerResponse;
use crate::fetch::TaskRegistry;
use crate::torrent::InfoHash;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use rand::Rng;
use std::io::Cursor;
use std::net::SocketAddr;
use tokio::net::lookup_host;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing::debug;
use tracing::warn;

/// Budget for the whole connect + announce exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(12);

/// Magic constant opening every connect request, see BEP 15.
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;

const NUM_WANT: i32 = 100;

/// Announces to one UDP tracker.
///
/// DNS failures, send errors and the overall timeout all degrade to zero
/// peers; cancellation closes the socket.
pub async fn announce(
    registry: &TaskRegistry,
    host: &str,
    port: u16,
    info_hash: &InfoHash,
    peer_id: &[u8; 20],
) -> TrackerResponse {
    match try_announce(registry, host, port, info_hash, peer_id).await {
        Ok(response) => response,
        Err(err) => {
            debug!(host, port, "udp announce failed: {err}");
            TrackerResponse::empty()
        }
    }
}

async fn try_announce(
    registry: &TaskRegistry,
    host: &str,
    port: u16,
    info_hash: &InfoHash,
    peer_id: &[u8; 20],
) -> Result<TrackerResponse> {
    let addr = lookup_host((host, port))
        .await?
        .find(SocketAddr::is_ipv4)
        .context("no IPv4 address for tracker")?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;

    let registration = registry.register();
    tokio::select! {
        _ = registration.cancelled() => {
            // dropping the socket closes the endpoint
            bail!("cancelled")
        }
        result = timeout(EXCHANGE_TIMEOUT, exchange(&socket, info_hash, peer_id)) => {
            result.context("udp tracker timed out")?
        }
    }
}

/// The two-step state machine: connect, then announce.
async fn exchange(
    socket: &UdpSocket,
    info_hash: &InfoHash,
    peer_id: &[u8; 20],
) -> Result<TrackerResponse> {
    let mut buf = vec![0u8; 4096];

    // state 0: connect
    let transaction_id: u32 = rand::rng().random();
    let mut request = Vec::with_capacity(16);
    request.write_u64::<BigEndian>(PROTOCOL_ID)?;
    request.write_i32::<BigEndian>(ACTION_CONNECT)?;
    request.write_u32::<BigEndian>(transaction_id)?;
    socket.send(&request).await?;

    let connection_id = loop {
        let len = socket.recv(&mut buf).await?;
        if len < 16 {
            warn!("short connect response");
            continue;
        }
        let mut reply = Cursor::new(&buf[..len]);
        let action = reply.read_i32::<BigEndian>()?;
        let tx = reply.read_u32::<BigEndian>()?;
        if action != ACTION_CONNECT || tx != transaction_id {
            // stray datagram; keep waiting
            continue;
        }
        break reply.read_u64::<BigEndian>()?;
    };

    // state 1: announce
    let transaction_id: u32 = rand::rng().random();
    let mut request = Vec::with_capacity(98);
    request.write_u64::<BigEndian>(connection_id)?;
    request.write_i32::<BigEndian>(ACTION_ANNOUNCE)?;
    request.write_u32::<BigEndian>(transaction_id)?;
    request.extend_from_slice(info_hash.as_bytes());
    request.extend_from_slice(peer_id);
    request.write_i64::<BigEndian>(0)?; // downloaded
    request.write_i64::<BigEndian>(0)?; // left
    request.write_i64::<BigEndian>(0)?; // uploaded
    request.write_i32::<BigEndian>(0)?; // event
    request.write_u32::<BigEndian>(0)?; // ip
    request.write_u32::<BigEndian>(0)?; // key
    request.write_i32::<BigEndian>(NUM_WANT)?;
    request.write_u16::<BigEndian>(0)?; // port
    socket.send(&request).await?;

    loop {
        let len = socket.recv(&mut buf).await?;
        if len < 20 {
            warn!("short announce response");
            continue;
        }
        let mut reply = Cursor::new(&buf[..len]);
        let action = reply.read_i32::<BigEndian>()?;
        let tx = reply.read_u32::<BigEndian>()?;
        if action != ACTION_ANNOUNCE || tx != transaction_id {
            continue;
        }
        let _interval = reply.read_i32::<BigEndian>()?;
        let leechers = reply.read_i32::<BigEndian>()?;
        let seeders = reply.read_i32::<BigEndian>()?;
        return Ok(TrackerResponse {
            seeders: seeders.into(),
            leechers: leechers.into(),
            peers: super::parse_compact_peers(&buf[20..len]),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-process BEP 15 tracker serving one connect/announce exchange.
    async fn spawn_tracker(peers: &'static [u8]) -> (String, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];

            let (len, addr) = socket.recv_from(&mut buf).await.unwrap();
            assert!(len >= 16);
            let mut request = Cursor::new(&buf[..len]);
            assert_eq!(request.read_u64::<BigEndian>().unwrap(), PROTOCOL_ID);
            assert_eq!(request.read_i32::<BigEndian>().unwrap(), ACTION_CONNECT);
            let tx = request.read_u32::<BigEndian>().unwrap();

            let mut reply = Vec::new();
            reply.write_i32::<BigEndian>(ACTION_CONNECT).unwrap();
            reply.write_u32::<BigEndian>(tx).unwrap();
            reply.write_u64::<BigEndian>(0x1122334455667788).unwrap();
            socket.send_to(&reply, addr).await.unwrap();

            let (len, addr) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 98);
            let mut request = Cursor::new(&buf[..len]);
            assert_eq!(request.read_u64::<BigEndian>().unwrap(), 0x1122334455667788);
            assert_eq!(request.read_i32::<BigEndian>().unwrap(), ACTION_ANNOUNCE);
            let tx = request.read_u32::<BigEndian>().unwrap();

            let mut reply = Vec::new();
            reply.write_i32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
            reply.write_u32::<BigEndian>(tx).unwrap();
            reply.write_i32::<BigEndian>(1800).unwrap(); // interval
            reply.write_i32::<BigEndian>(3).unwrap(); // leechers
            reply.write_i32::<BigEndian>(9).unwrap(); // seeders
            reply.extend_from_slice(peers);
            socket.send_to(&reply, addr).await.unwrap();
        });
        ("127.0.0.1".to_string(), port)
    }

    #[tokio::test]
    async fn runs_connect_then_announce() {
        let (host, port) = spawn_tracker(b"\x01\x02\x03\x04\x1a\xe1\x05\x06\x07\x08\x00\x50").await;
        let registry = TaskRegistry::default();
        let response = announce(&registry, &host, port, &InfoHash([1u8; 20]), &[2u8; 20]).await;
        assert_eq!(response.seeders, 9);
        assert_eq!(response.leechers, 3);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].port(), 6881);
        assert_eq!(response.peers[1].port(), 80);
    }

    #[tokio::test]
    async fn dns_failure_yields_zero_peers() {
        let registry = TaskRegistry::default();
        let response = announce(
            &registry,
            "tracker.invalid.domain.example",
            6969,
            &InfoHash([1u8; 20]),
            &[2u8; 20],
        )
        .await;
        assert_eq!(response, TrackerResponse::empty());
    }
}
