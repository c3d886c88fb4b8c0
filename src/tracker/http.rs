//! HTTP tracker announce (BEP 3 with BEP 23 compact responses).
use super::url_encode;
use super::TrackerResponse;
use crate::fetch::TaskRegistry;
use crate::torrent::InfoHash;
use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use tokio::time::Duration;
use tracing::debug;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(7);

#[derive(Debug, Deserialize)]
struct AnnounceResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<ByteBuf>,
    #[serde(default)]
    complete: i64,
    #[serde(default)]
    incomplete: i64,
    #[serde(default)]
    peers: ByteBuf,
}

/// Sends an announce request to the tracker to get a list of peers.
///
/// Any failure (connect, timeout, non-200, `failure reason` in the body,
/// undecodable body) degrades to zero peers.
pub async fn announce(
    registry: &TaskRegistry,
    tracker: &str,
    info_hash: &InfoHash,
    peer_id: &[u8; 20],
    port: u16,
) -> TrackerResponse {
    match try_announce(registry, tracker, info_hash, peer_id, port).await {
        Ok(response) => response,
        Err(err) => {
            debug!(tracker, "announce failed: {err}");
            TrackerResponse::empty()
        }
    }
}

async fn try_announce(
    registry: &TaskRegistry,
    tracker: &str,
    info_hash: &InfoHash,
    peer_id: &[u8; 20],
    port: u16,
) -> Result<TrackerResponse> {
    // the info-hash is raw bytes, so the query string is assembled by
    // hand rather than through a pair encoder
    let url = format!(
        "{tracker}?info_hash={}&peer_id={}&port={port}\
         &uploaded=0&downloaded=0&left=16384&compact=1&event=started\
         &no_peer_id=1&numwant=200",
        url_encode(info_hash.as_bytes()),
        url_encode(peer_id),
    );
    debug!(%url, "making announce request to tracker");

    let client = reqwest::Client::builder()
        .timeout(ANNOUNCE_TIMEOUT)
        .build()?;
    let response = client.get(&url).send().await?;
    if response.status() != reqwest::StatusCode::OK {
        bail!("tracker returned status {}", response.status());
    }

    // the body read is registered so a winning peer task can cut it short
    let registration = registry.register();
    let body = tokio::select! {
        _ = registration.cancelled() => bail!("cancelled"),
        body = response.bytes() => body?,
    };
    drop(registration);

    let announce: AnnounceResponse = serde_bencode::from_bytes(&body)?;
    if let Some(reason) = announce.failure_reason {
        bail!(
            "tracker refused announce: {}",
            String::from_utf8_lossy(&reason)
        );
    }

    Ok(TrackerResponse {
        seeders: announce.complete,
        leechers: announce.incomplete,
        peers: super::parse_compact_peers(&announce.peers),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// One-shot HTTP server returning a canned body.
    async fn spawn_tracker(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = stream.read(&mut request).await;
            let response = [
                format!(
                    "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                )
                .into_bytes(),
                body.to_vec(),
            ]
            .concat();
            stream.write_all(&response).await.unwrap();
        });
        format!("http://{addr}/announce")
    }

    #[tokio::test]
    async fn parses_compact_peer_list() {
        let url = spawn_tracker(
            "200 OK",
            b"d8:completei5e10:incompletei2e8:intervali1800e5:peers6:\x01\x02\x03\x04\x1a\xe1e",
        )
        .await;
        let registry = TaskRegistry::default();
        let response = announce(&registry, &url, &InfoHash([1u8; 20]), &[2u8; 20], 6881).await;
        assert_eq!(response.seeders, 5);
        assert_eq!(response.leechers, 2);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port(), 6881);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failure_reason_yields_zero_peers() {
        let url = spawn_tracker("200 OK", b"d14:failure reason9:forbiddene").await;
        let registry = TaskRegistry::default();
        let response = announce(&registry, &url, &InfoHash([1u8; 20]), &[2u8; 20], 6881).await;
        assert_eq!(response, TrackerResponse::empty());
    }

    #[tokio::test]
    async fn non_200_status_yields_zero_peers() {
        let url = spawn_tracker("503 Service Unavailable", b"").await;
        let registry = TaskRegistry::default();
        let response = announce(&registry, &url, &InfoHash([1u8; 20]), &[2u8; 20], 6881).await;
        assert_eq!(response, TrackerResponse::empty());
    }

    #[tokio::test]
    async fn connection_refused_yields_zero_peers() {
        let registry = TaskRegistry::default();
        let response = announce(
            &registry,
            "http://127.0.0.1:1/announce",
            &InfoHash([1u8; 20]),
            &[2u8; 20],
            6881,
        )
        .await;
        assert_eq!(response, TrackerResponse::empty());
    }
}
