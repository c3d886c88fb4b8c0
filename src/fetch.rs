//! The orchestrator: race every peer source, try each discovered peer
//! once, and return the first hash-verified `info` wrapped as a torrent.
use crate::bencode;
use crate::config::Config;
use crate::dht::PeerStream;
use crate::magnet::MagnetError;
use crate::magnet::MagnetLink;
use crate::peer;
use crate::torrent;
use crate::torrent::TorrentError;
use crate::tracker;
use crate::tracker::TrackerResponse;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Magnet(#[from] MagnetError),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error("failed to fetch torrent metadata")]
    FailedToFetch,
}

/// Cancellation points registered by subsidiary waits inside source and
/// peer tasks (a tracker body read, a UDP exchange, a metadata
/// download, a DHT crawl).
///
/// When a peer wins, the orchestrator cancels every live registration so
/// siblings abort cleanly instead of running out their timeouts.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tokens: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    next_id: Arc<AtomicU64>,
}

impl TaskRegistry {
    pub fn register(&self) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.tokens.lock().unwrap().insert(id, token.clone());
        Registration {
            registry: self.clone(),
            id,
            token,
        }
    }

    pub fn cancel_all(&self) {
        for token in self.tokens.lock().unwrap().values() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One registered wait; deregisters itself on drop.
#[derive(Debug)]
pub struct Registration {
    registry: TaskRegistry,
    id: u64,
    token: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.tokens.lock().unwrap().remove(&self.id);
    }
}

/// What a finished source or peer task reports back; this replaces
/// tagging tasks by name.
enum SourceOutcome {
    /// A batch of peer addresses. `next` carries the rest of a DHT
    /// stream, to be re-enqueued.
    Peers {
        response: TrackerResponse,
        next: Option<PeerStream>,
    },
    /// A peer task finished, with verified metadata on success.
    Metadata(Option<Vec<u8>>),
}

/// Turns magnet links into `.torrent` files using the sources enabled in
/// its [`Config`].
#[derive(Debug, Clone)]
pub struct Fetcher {
    config: Config,
}

impl Fetcher {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// The tracker list used both for announcing and for the torrent
    /// envelope.
    fn trackers(&self, magnet: &MagnetLink) -> Vec<String> {
        if !self.config.use_trackers {
            return Vec::new();
        }
        let mut trackers = magnet.trackers.clone();
        if self.config.use_additional_trackers {
            trackers.extend(crate::config::DEFAULT_TRACKERS.iter().map(|t| t.to_string()));
        }
        trackers
    }

    /// Resolves a magnet link into `(filename, torrent bytes)`.
    ///
    /// Every configured tracker and the DHT are queried concurrently;
    /// each fresh peer address gets one metadata attempt. The first peer
    /// to deliver a SHA-1-verified `info` wins and everything else is
    /// cancelled. [`FetchError::FailedToFetch`] is raised only when all
    /// sources and peers are exhausted.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn retrieve(&self, magnet_link: &str) -> Result<(String, Vec<u8>), FetchError> {
        let magnet = MagnetLink::parse(magnet_link)?;
        let trackers = self.trackers(&magnet);

        let cache_path = self
            .config
            .torrent_cache_folder
            .as_ref()
            .map(|root| root.join(magnet.info_hash.cache_path()));
        if let Some(path) = &cache_path {
            if let Some(metadata) = read_cache(path).await {
                info!(info_hash = %magnet.info_hash, "serving metadata from cache");
                return self.package(&magnet, &trackers, &metadata);
            }
        }

        let registry = TaskRegistry::default();
        let mut tasks: JoinSet<SourceOutcome> = JoinSet::new();
        for tracker in &trackers {
            debug!(tracker, "trying to fetch peers");
            let tracker = tracker.clone();
            let registry = registry.clone();
            let info_hash = magnet.info_hash;
            let peer_id = self.config.peer_id;
            let port = self.config.bittorrent_port;
            tasks.spawn(async move {
                let response =
                    tracker::announce(&registry, &tracker, &info_hash, &peer_id, port).await;
                SourceOutcome::Peers {
                    response,
                    next: None,
                }
            });
        }
        if let Some(dht) = &self.config.dht {
            debug!("trying to fetch peers from the DHT");
            let stream = dht.find_peers(&registry, magnet.info_hash);
            tasks.spawn(next_dht_batch(stream));
        }

        // every address is attempted at most once per retrieve call
        let mut handled_peers = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    if !err.is_cancelled() {
                        warn!("task failed: {err}");
                    }
                    continue;
                }
            };
            match outcome {
                SourceOutcome::Peers { response, next } => {
                    for peer in response.peers {
                        if !handled_peers.insert(peer) {
                            continue;
                        }
                        debug!(%peer, "connecting to peer");
                        let registry = registry.clone();
                        let info_hash = magnet.info_hash;
                        let peer_id = self.config.peer_id;
                        tasks.spawn(async move {
                            SourceOutcome::Metadata(
                                peer::fetch_from_peer(&registry, peer, info_hash, peer_id).await,
                            )
                        });
                    }
                    if let Some(stream) = next {
                        tasks.spawn(next_dht_batch(stream));
                    }
                }
                SourceOutcome::Metadata(Some(metadata)) => {
                    info!(info_hash = %magnet.info_hash, "metadata verified");
                    registry.cancel_all();
                    tasks.abort_all();
                    if let Some(path) = &cache_path {
                        write_cache(path, &metadata).await;
                    }
                    return self.package(&magnet, &trackers, &metadata);
                }
                SourceOutcome::Metadata(None) => {}
            }
        }

        Err(FetchError::FailedToFetch)
    }

    fn package(
        &self,
        magnet: &MagnetLink,
        trackers: &[String],
        metadata: &[u8],
    ) -> Result<(String, Vec<u8>), FetchError> {
        let torrent = torrent::build_torrent(metadata, trackers)?;
        Ok((format!("{}.torrent", magnet.name()), torrent))
    }
}

/// Awaits the next batch of a DHT peer stream. A live stream hands
/// itself back through `next` so the orchestrator re-enqueues it.
async fn next_dht_batch(mut stream: PeerStream) -> SourceOutcome {
    let response = |peers| TrackerResponse {
        seeders: 0,
        leechers: 0,
        peers,
    };
    match stream.recv().await {
        Some(peers) => SourceOutcome::Peers {
            response: response(peers),
            next: Some(stream),
        },
        None => SourceOutcome::Peers {
            response: response(Vec::new()),
            next: None,
        },
    }
}

/// A cache hit must still be a bencoded dictionary; anything else is
/// treated as a miss.
async fn read_cache(path: &Path) -> Option<Vec<u8>> {
    let data = tokio::fs::read(path).await.ok()?;
    match bencode::decode(&data) {
        Ok(value) if value.as_dict().is_some() => Some(data),
        _ => {
            warn!(path = %path.display(), "ignoring corrupt cache entry");
            None
        }
    }
}

async fn write_cache(path: &Path, metadata: &[u8]) {
    if let Some(parent) = path.parent() {
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            warn!("failed to create cache directory: {err}");
            return;
        }
    }
    if let Err(err) = tokio::fs::write(path, metadata).await {
        warn!("failed to write cache entry: {err}");
    }
}
