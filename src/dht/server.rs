//! High-level view of our DHT node: socket lifecycle, bootstrap, bucket
//! refresh, state snapshots and the peer-lookup stream.
use super::krpc::Krpc;
use super::node::Node;
use super::node::NodeId;
use super::routing::Bucket;
use super::spider;
use crate::bencode;
use crate::bencode::BencodeValue;
use crate::bencode::Dict;
use crate::fetch::TaskRegistry;
use crate::torrent::InfoHash;
use anyhow::Context;
use futures::future::join_all;
use std::io;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub const DEFAULT_KSIZE: usize = 8;
pub const DEFAULT_ALPHA: usize = 100;

const REFRESH_INTERVAL: Duration = Duration::from_secs(900);
const SAVE_STATE_INTERVAL: Duration = Duration::from_secs(600);

/// Peer batches produced by a [`DhtServer::find_peers`] lookup. The
/// stream ends with exactly one empty batch, after which the sender side
/// is gone.
pub type PeerStream = UnboundedReceiver<Vec<SocketAddrV4>>;

/// A running DHT node. Cheap to clone; all clones share the socket and
/// routing state.
#[derive(Debug, Clone)]
pub struct DhtServer {
    krpc: Arc<Krpc>,
    ksize: usize,
    alpha: usize,
}

impl DhtServer {
    /// Binds the UDP socket, restores the routing table from `state` and
    /// schedules the periodic bucket refresh.
    pub async fn listen(iface: Ipv4Addr, port: u16, state: DhtState) -> io::Result<Self> {
        let buckets = state.restore_buckets();
        let krpc = Krpc::bind(iface, port, state.id, state.ksize, buckets).await?;
        info!(node_id = %state.id_hex(), %iface, port, "DHT node listening");
        let server = Self {
            krpc,
            ksize: state.ksize,
            alpha: state.alpha,
        };
        tokio::spawn(server.clone().refresh_loop());
        Ok(server)
    }

    pub fn node_id(&self) -> NodeId {
        self.krpc.our_id()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.krpc.local_addr()
    }

    /// Stops the receive loop and the periodic tasks.
    pub fn stop(&self) {
        self.krpc.shutdown();
    }

    /// Pings each known address, admits the responders and then crawls
    /// toward our own ID to populate the nearby buckets.
    pub async fn bootstrap(&self, addrs: &[SocketAddrV4]) -> Vec<Node> {
        debug!(contacts = addrs.len(), "bootstrapping");
        let pings = addrs.iter().map(|addr| self.krpc.call_ping(*addr));
        let responders: Vec<Node> = join_all(pings).await.into_iter().flatten().collect();
        spider::node_spider(
            Arc::clone(&self.krpc),
            self.node_id(),
            responders,
            self.ksize,
            self.alpha,
            CancellationToken::new(),
        )
        .await
    }

    /// Starts a streaming peer lookup for `info_hash`.
    ///
    /// The crawl runs in the background and registers itself with
    /// `registry`; cancelling the registry stops the crawl, which still
    /// emits its terminal empty batch. With no known neighbors the
    /// stream consists of the terminal batch alone.
    pub fn find_peers(&self, registry: &TaskRegistry, info_hash: InfoHash) -> PeerStream {
        let (batches, stream) = mpsc::unbounded_channel();
        let target = NodeId(info_hash.0);
        let nearest = self.krpc.find_neighbors(&target, self.ksize * 4);
        if nearest.is_empty() {
            info!(%info_hash, "no known neighbors to start a peer lookup");
            let _ = batches.send(Vec::new());
            return stream;
        }

        debug!(%info_hash, seeds = nearest.len(), "starting peer lookup");
        let registration = registry.register();
        let krpc = Arc::clone(&self.krpc);
        let width = self.ksize * 4;
        let alpha = self.alpha;
        tokio::spawn(async move {
            spider::peer_spider(
                krpc,
                target,
                nearest,
                width,
                alpha,
                registration.token(),
                batches,
            )
            .await;
            drop(registration);
        });
        stream
    }

    /// A snapshot of `{ksize, alpha, id, buckets}`, sufficient to
    /// restore the routing state after a restart.
    pub fn state(&self) -> DhtState {
        let buckets = self
            .krpc
            .bucket_snapshots()
            .iter()
            .map(|bucket| BucketState {
                lo: *bucket.lo(),
                hi: *bucket.hi(),
                nodes: bucket.nodes().to_vec(),
                age_secs: bucket.age().as_secs(),
            })
            .collect();
        DhtState {
            ksize: self.ksize,
            alpha: self.alpha,
            id: self.node_id(),
            buckets,
        }
    }

    pub async fn save_state(&self, path: &Path) -> io::Result<()> {
        info!(path = %path.display(), "saving DHT state");
        tokio::fs::write(path, self.state().encode()).await
    }

    /// Rewrites the state file on a fixed schedule until [`stop`] is
    /// called.
    ///
    /// [`stop`]: DhtServer::stop
    pub fn save_state_regularly(&self, path: PathBuf) {
        let server = self.clone();
        let shutdown = self.krpc.shutdown_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAVE_STATE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = server.save_state(&path).await {
                            warn!("failed to save DHT state: {err}");
                        }
                    }
                }
            }
        });
    }

    /// Every 15 minutes, crawl toward a random ID inside each bucket
    /// that has gone an hour without traffic.
    async fn refresh_loop(self) {
        let shutdown = self.krpc.shutdown_token();
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.tick().await; // listen() itself counts as fresh
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let targets = self.krpc.refresh_targets();
                    if !targets.is_empty() {
                        debug!(buckets = targets.len(), "refreshing lonely buckets");
                    }
                    let crawls = targets.into_iter().map(|target| {
                        let seeds = self.krpc.find_neighbors(&target, self.alpha);
                        spider::node_spider(
                            Arc::clone(&self.krpc),
                            target,
                            seeds,
                            self.ksize,
                            self.alpha,
                            shutdown.clone(),
                        )
                    });
                    join_all(crawls).await;
                }
            }
        }
    }
}

/// The persisted routing state: `{ksize, alpha, id, buckets}`.
#[derive(Debug, Clone)]
pub struct DhtState {
    pub ksize: usize,
    pub alpha: usize,
    pub id: NodeId,
    buckets: Vec<BucketState>,
}

#[derive(Debug, Clone)]
struct BucketState {
    lo: [u8; 20],
    hi: [u8; 20],
    nodes: Vec<Node>,
    age_secs: u64,
}

impl Default for DhtState {
    fn default() -> Self {
        Self {
            ksize: DEFAULT_KSIZE,
            alpha: DEFAULT_ALPHA,
            id: NodeId::random(),
            buckets: Vec::new(),
        }
    }
}

impl DhtState {
    fn id_hex(&self) -> String {
        hex::encode(self.id.0)
    }

    fn restore_buckets(&self) -> Vec<Bucket> {
        self.buckets
            .iter()
            .map(|state| {
                Bucket::restore(
                    state.lo,
                    state.hi,
                    self.ksize,
                    state.nodes.clone(),
                    Duration::from_secs(state.age_secs),
                )
            })
            .collect()
    }

    /// Bencodes the snapshot. Buckets serialize as
    /// `{lo, hi, nodes: [compact26...], last_updated: age-in-seconds}`.
    pub fn encode(&self) -> Vec<u8> {
        let buckets = self
            .buckets
            .iter()
            .map(|bucket| {
                let mut dict = Dict::new();
                dict.insert(b"lo".to_vec(), bucket.lo.as_slice().into());
                dict.insert(b"hi".to_vec(), bucket.hi.as_slice().into());
                dict.insert(
                    b"nodes".to_vec(),
                    BencodeValue::List(
                        bucket
                            .nodes
                            .iter()
                            .map(|node| node.packed().as_slice().into())
                            .collect(),
                    ),
                );
                dict.insert(
                    b"last_updated".to_vec(),
                    (bucket.age_secs.min(i64::MAX as u64) as i64).into(),
                );
                BencodeValue::Dict(dict)
            })
            .collect();

        let mut state = Dict::new();
        state.insert(b"ksize".to_vec(), (self.ksize as i64).into());
        state.insert(b"alpha".to_vec(), (self.alpha as i64).into());
        state.insert(b"id".to_vec(), self.id.0.as_slice().into());
        state.insert(b"buckets".to_vec(), BencodeValue::List(buckets));
        bencode::encode_to_vec(&BencodeValue::Dict(state)).expect("in-memory encode")
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let state = bencode::decode(data)
            .ok()
            .and_then(BencodeValue::into_dict)
            .context("state file is not a bencoded dictionary")?;
        let ksize = state
            .get(b"ksize".as_slice())
            .and_then(|v| v.as_int())
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v > 0)
            .context("missing ksize")?;
        let alpha = state
            .get(b"alpha".as_slice())
            .and_then(|v| v.as_int())
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v > 0)
            .context("missing alpha")?;
        let id = state
            .get(b"id".as_slice())
            .and_then(|v| v.as_bytes())
            .and_then(NodeId::from_bytes)
            .context("missing node id")?;

        let mut buckets = Vec::new();
        for bucket in state
            .get(b"buckets".as_slice())
            .and_then(|v| v.as_list())
            .unwrap_or(&[])
        {
            let dict = bucket.as_dict().context("bucket is not a dictionary")?;
            let lo: [u8; 20] = dict
                .get(b"lo".as_slice())
                .and_then(|v| v.as_bytes())
                .and_then(|b| b.try_into().ok())
                .context("missing bucket lo bound")?;
            let hi: [u8; 20] = dict
                .get(b"hi".as_slice())
                .and_then(|v| v.as_bytes())
                .and_then(|b| b.try_into().ok())
                .context("missing bucket hi bound")?;
            let age_secs = dict
                .get(b"last_updated".as_slice())
                .and_then(|v| v.as_int())
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(0);
            let nodes = dict
                .get(b"nodes".as_slice())
                .and_then(|v| v.as_list())
                .unwrap_or(&[])
                .iter()
                .filter_map(|packed| Node::from_compact(packed.as_bytes()?))
                .collect();
            buckets.push(BucketState {
                lo,
                hi,
                nodes,
                age_secs,
            });
        }

        Ok(Self {
            ksize,
            alpha,
            id,
            buckets,
        })
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        info!(path = %path.display(), "loading DHT state");
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::decode(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> DhtState {
        let node = Node::new(
            NodeId([3u8; 20]),
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 6881),
        );
        DhtState {
            ksize: 8,
            alpha: 100,
            id: NodeId([1u8; 20]),
            buckets: vec![BucketState {
                lo: [0u8; 20],
                hi: [0xffu8; 20],
                nodes: vec![node],
                age_secs: 120,
            }],
        }
    }

    #[test]
    fn state_round_trips_through_bencode() {
        let state = test_state();
        let restored = DhtState::decode(&state.encode()).unwrap();
        assert_eq!(restored.ksize, 8);
        assert_eq!(restored.alpha, 100);
        assert_eq!(restored.id, state.id);
        assert_eq!(restored.buckets.len(), 1);
        let bucket = &restored.buckets[0];
        assert_eq!(bucket.age_secs, 120);
        assert_eq!(bucket.nodes.len(), 1);
        assert_eq!(bucket.nodes[0].id, NodeId([3u8; 20]));
        assert_eq!(
            bucket.nodes[0].addr,
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 6881)
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(DhtState::decode(b"not bencode").is_err());
        assert!(DhtState::decode(b"d5:ksizei8ee").is_err());
    }

    #[tokio::test]
    async fn restored_state_preserves_routing_table() {
        let state = test_state();
        let server = DhtServer::listen(Ipv4Addr::LOCALHOST, 0, state).await.unwrap();
        let snapshot = server.state();
        assert_eq!(snapshot.buckets.len(), 1);
        assert_eq!(snapshot.buckets[0].nodes.len(), 1);
        // ages only ever grow
        assert!(snapshot.buckets[0].age_secs >= 120);
        server.stop();
    }

    #[tokio::test]
    async fn find_peers_without_neighbors_emits_single_terminal_batch() {
        let server = DhtServer::listen(Ipv4Addr::LOCALHOST, 0, DhtState::default())
            .await
            .unwrap();
        let registry = TaskRegistry::default();
        let mut stream = server.find_peers(&registry, InfoHash([7u8; 20]));

        assert_eq!(stream.recv().await, Some(Vec::new()));
        assert_eq!(stream.recv().await, None);
        server.stop();
    }
}
