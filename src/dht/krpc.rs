//! KRPC: bencoded queries and responses over UDP (BEP 5).
//!
//! One [`Krpc`] owns the UDP socket, the routing table and the table of
//! outstanding transactions. A background receive loop resolves responses
//! and answers the four supported queries: `ping`, `find_node`,
//! `get_peers` and `announce_peer`.
use super::node::Node;
use super::node::NodeId;
use super::routing::Bucket;
use super::routing::RoutingTable;
use super::storage::PeerStorage;
use super::storage::TokenStorage;
use crate::bencode;
use crate::bencode::BencodeValue;
use crate::bencode::Dict;
use crate::torrent::InfoHash;
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long an outbound call waits for its response.
pub const KRPC_TIMEOUT: Duration = Duration::from_secs(5);

type TxId = [u8; 20];

/// A KRPC endpoint bound to one UDP socket.
///
/// Shared state is mutated from the receive loop and from caller tasks;
/// lock order is routing table before outstanding transactions.
#[derive(Debug)]
pub struct Krpc {
    socket: UdpSocket,
    our_id: NodeId,
    ksize: usize,
    // for spawning background pings from &self contexts
    me: Weak<Krpc>,
    router: Mutex<RoutingTable>,
    outstanding: Mutex<HashMap<TxId, oneshot::Sender<Dict>>>,
    peer_storage: Mutex<PeerStorage>,
    token_storage: Mutex<TokenStorage>,
    shutdown: CancellationToken,
}

impl Krpc {
    /// Binds the socket and starts the receive loop.
    pub async fn bind(
        iface: Ipv4Addr,
        port: u16,
        our_id: NodeId,
        ksize: usize,
        buckets: Vec<Bucket>,
    ) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind((iface, port)).await?;
        let krpc = Arc::new_cyclic(|me| Self {
            socket,
            our_id,
            ksize,
            me: me.clone(),
            router: Mutex::new(RoutingTable::from_buckets(our_id, ksize, buckets)),
            outstanding: Mutex::new(HashMap::new()),
            peer_storage: Mutex::new(PeerStorage::default()),
            token_storage: Mutex::new(TokenStorage::default()),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&krpc).receive_loop());
        Ok(krpc)
    }

    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Stops the receive loop; outstanding calls run into their timeouts.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Observed by the periodic background loops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn find_neighbors(&self, target: &NodeId, k: usize) -> Vec<Node> {
        self.router
            .lock()
            .unwrap()
            .find_neighbors(target, k, None)
    }

    /// Random lookup targets, one inside each bucket that has gone quiet.
    pub fn refresh_targets(&self) -> Vec<NodeId> {
        self.router
            .lock()
            .unwrap()
            .lonely_buckets()
            .iter()
            .map(|bucket| bucket.random_id())
            .collect()
    }

    /// A point-in-time copy of the routing buckets, for state snapshots.
    pub fn bucket_snapshots(&self) -> Vec<Bucket> {
        self.router.lock().unwrap().buckets().to_vec()
    }

    #[cfg(test)]
    pub(crate) fn store_peer(&self, info_hash: InfoHash, peer: SocketAddrV4) {
        self.peer_storage.lock().unwrap().insert_peer(info_hash, peer);
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    // IPv6 peers are out of scope
                    Ok((len, SocketAddr::V4(addr))) => self.handle_datagram(&buf[..len], addr).await,
                    Ok(_) => {}
                    Err(err) => debug!("recv error: {err}"),
                },
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], addr: SocketAddrV4) {
        let mut message = match bencode::decode_lax(data) {
            Ok(BencodeValue::Dict(dict)) => dict,
            Ok(_) => return,
            Err(err) => {
                debug!(%addr, "failed to decode datagram: {err}");
                return;
            }
        };
        let Some(tx_id) = message
            .get(b"t".as_slice())
            .and_then(|v| v.as_bytes())
            .map(<[u8]>::to_vec)
        else {
            return;
        };

        match message.get(b"y".as_slice()).and_then(|v| v.as_bytes()) {
            Some(b"q") => {
                let Some(method) = message
                    .get(b"q".as_slice())
                    .and_then(|v| v.as_bytes())
                    .map(<[u8]>::to_vec)
                else {
                    return;
                };
                let Some(BencodeValue::Dict(args)) = message.remove(b"a".as_slice()) else {
                    return;
                };
                if let Some(reply) = self.handle_request(&method, &args, addr) {
                    self.respond(tx_id, reply, addr).await;
                }
            }
            Some(b"r") => {
                let Some(BencodeValue::Dict(args)) = message.remove(b"r".as_slice()) else {
                    return;
                };
                let Ok(tx_id) = TxId::try_from(tx_id.as_slice()) else {
                    return;
                };
                let resolver = self.outstanding.lock().unwrap().remove(&tx_id);
                match resolver {
                    Some(tx) => {
                        let _ = tx.send(args);
                    }
                    None => debug!(%addr, "response for unknown transaction; dropping"),
                }
            }
            _ => {}
        }
    }

    async fn respond(&self, tx_id: Vec<u8>, reply: Dict, addr: SocketAddrV4) {
        let mut message = Dict::new();
        message.insert(b"t".to_vec(), tx_id.into());
        message.insert(b"y".to_vec(), b"r".as_slice().into());
        message.insert(b"r".to_vec(), BencodeValue::Dict(reply));
        let Ok(encoded) = bencode::encode_to_vec(&BencodeValue::Dict(message)) else {
            return;
        };
        if let Err(err) = self.socket.send_to(&encoded, addr).await {
            debug!(%addr, "failed to send response: {err}");
        }
    }

    /// Dispatches a query to its handler; unsupported methods are ignored
    /// silently.
    fn handle_request(&self, method: &[u8], args: &Dict, addr: SocketAddrV4) -> Option<Dict> {
        let sender_id = valid_node_id(args.get(b"id".as_slice())?)?;
        match method {
            b"ping" => self.rpc_ping(sender_id, addr),
            b"find_node" => self.rpc_find_node(sender_id, args, addr, None),
            b"get_peers" => self.rpc_get_peers(sender_id, args, addr),
            b"announce_peer" => self.rpc_announce_peer(sender_id, args, addr),
            _ => None,
        }
    }

    fn rpc_ping(&self, sender_id: NodeId, addr: SocketAddrV4) -> Option<Dict> {
        self.welcome_if_new(Node::new(sender_id, addr));
        let mut reply = Dict::new();
        reply.insert(b"id".to_vec(), self.our_id.0.as_slice().into());
        Some(reply)
    }

    fn rpc_find_node(
        &self,
        sender_id: NodeId,
        args: &Dict,
        addr: SocketAddrV4,
        token: Option<[u8; 16]>,
    ) -> Option<Dict> {
        let target = match token {
            // degraded get_peers answer: the key arrives as info_hash
            Some(_) => valid_node_id(args.get(b"info_hash".as_slice())?)?,
            None => valid_node_id(args.get(b"target".as_slice())?)?,
        };
        self.welcome_if_new(Node::new(sender_id, addr));

        let neighbors =
            self.router
                .lock()
                .unwrap()
                .find_neighbors(&target, self.ksize, Some(&sender_id));
        let mut nodes = Vec::with_capacity(neighbors.len() * 26);
        for node in &neighbors {
            nodes.extend_from_slice(&node.packed());
        }

        let mut reply = Dict::new();
        reply.insert(b"id".to_vec(), self.our_id.0.as_slice().into());
        reply.insert(b"nodes".to_vec(), nodes.into());
        if let Some(token) = token {
            reply.insert(b"token".to_vec(), token.as_slice().into());
        }
        Some(reply)
    }

    /// Returns cached peers as `values` when we have any for the
    /// info-hash, otherwise degrades to a `find_node` answer. A token is
    /// always included so the caller may `announce_peer` later.
    fn rpc_get_peers(&self, sender_id: NodeId, args: &Dict, addr: SocketAddrV4) -> Option<Dict> {
        let info_hash = InfoHash::from_bytes(args.get(b"info_hash".as_slice())?.as_bytes()?)?;
        self.welcome_if_new(Node::new(sender_id, addr));

        let peers = self.peer_storage.lock().unwrap().get_peers(&info_hash);
        let token = self
            .token_storage
            .lock()
            .unwrap()
            .get_token(*addr.ip(), sender_id, info_hash);
        if peers.is_empty() {
            return self.rpc_find_node(sender_id, args, addr, Some(token));
        }

        let values = peers
            .iter()
            .map(|peer| {
                let mut compact = Vec::with_capacity(6);
                compact.extend_from_slice(&peer.ip().octets());
                compact.extend_from_slice(&peer.port().to_be_bytes());
                compact.into()
            })
            .collect();
        let mut reply = Dict::new();
        reply.insert(b"id".to_vec(), self.our_id.0.as_slice().into());
        reply.insert(b"token".to_vec(), token.as_slice().into());
        reply.insert(b"values".to_vec(), BencodeValue::List(values));
        Some(reply)
    }

    fn rpc_announce_peer(
        &self,
        sender_id: NodeId,
        args: &Dict,
        addr: SocketAddrV4,
    ) -> Option<Dict> {
        let info_hash = InfoHash::from_bytes(args.get(b"info_hash".as_slice())?.as_bytes()?)?;
        let token = args.get(b"token".as_slice())?.as_bytes()?;
        self.welcome_if_new(Node::new(sender_id, addr));

        let verified = self
            .token_storage
            .lock()
            .unwrap()
            .verify_token(*addr.ip(), sender_id, info_hash, token);
        if verified {
            let implied = args
                .get(b"implied_port".as_slice())
                .and_then(|v| v.as_int())
                .unwrap_or(0);
            let port = if implied != 0 {
                // NAT helper: the UDP source port is the peer's real port
                addr.port()
            } else {
                u16::try_from(args.get(b"port".as_slice())?.as_int()?).ok()?
            };
            debug!(%addr, info_hash = %info_hash, "storing announced peer");
            self.peer_storage
                .lock()
                .unwrap()
                .insert_peer(info_hash, SocketAddrV4::new(*addr.ip(), port));
        } else {
            debug!(%addr, "invalid announce token");
        }

        let mut reply = Dict::new();
        reply.insert(b"id".to_vec(), self.our_id.0.as_slice().into());
        Some(reply)
    }

    /// Sends a query and waits for the matching response.
    ///
    /// Each transaction gets a fresh random 20-byte ID and exactly one
    /// timeout; whichever of response and timeout comes first removes the
    /// entry, so the loser finds nothing to resolve.
    pub async fn request(&self, addr: SocketAddrV4, method: &str, args: Dict) -> Option<Dict> {
        let mut tx_id: TxId = [0u8; 20];
        rand::rng().fill(&mut tx_id[..]);

        let mut message = Dict::new();
        message.insert(b"t".to_vec(), tx_id.as_slice().into());
        message.insert(b"y".to_vec(), b"q".as_slice().into());
        message.insert(b"q".to_vec(), method.as_bytes().into());
        message.insert(b"a".to_vec(), BencodeValue::Dict(args));
        let encoded = bencode::encode_to_vec(&BencodeValue::Dict(message)).ok()?;

        let (tx, rx) = oneshot::channel();
        self.outstanding.lock().unwrap().insert(tx_id, tx);
        if let Err(err) = self.socket.send_to(&encoded, addr).await {
            debug!(%addr, method, "send failed: {err}");
            self.outstanding.lock().unwrap().remove(&tx_id);
            return None;
        }

        match timeout(KRPC_TIMEOUT, rx).await {
            Ok(Ok(args)) => Some(args),
            Ok(Err(_)) => None,
            Err(_) => {
                self.outstanding.lock().unwrap().remove(&tx_id);
                debug!(%addr, method, "no reply within timeout");
                None
            }
        }
    }

    fn our_id_args(&self) -> Dict {
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), self.our_id.0.as_slice().into());
        args
    }

    /// Pings a bare address; used during bootstrap before the node's ID
    /// is known. Responders are admitted to the routing table.
    pub async fn call_ping(&self, addr: SocketAddrV4) -> Option<Node> {
        let response = self.request(addr, "ping", self.our_id_args()).await?;
        let id = valid_node_id(response.get(b"id".as_slice())?)?;
        let node = Node::new(id, addr);
        self.welcome_if_new(node.clone());
        Some(node)
    }

    pub async fn call_find_node(&self, node: &Node, target: &NodeId) -> Option<Dict> {
        let mut args = self.our_id_args();
        args.insert(b"target".to_vec(), target.0.as_slice().into());
        let result = self.request(node.addr, "find_node", args).await;
        self.handle_call_response(node, result)
    }

    pub async fn call_get_peers(&self, node: &Node, info_hash: &NodeId) -> Option<Dict> {
        let mut args = self.our_id_args();
        args.insert(b"info_hash".to_vec(), info_hash.0.as_slice().into());
        let result = self.request(node.addr, "get_peers", args).await;
        self.handle_call_response(node, result)
    }

    /// A response keeps the node in the routing table; silence evicts it.
    fn handle_call_response(&self, node: &Node, result: Option<Dict>) -> Option<Dict> {
        match result {
            Some(args) => {
                self.welcome_if_new(node.clone());
                Some(args)
            }
            None => {
                debug!(id = ?node.id, "unresponsive, removing from routing table");
                self.router.lock().unwrap().remove_contact(&node.id);
                None
            }
        }
    }

    /// Admits a node to the routing table. When its bucket is full the
    /// least-recently-seen member is pinged in the background and evicted
    /// if it stays silent, which promotes from the replacement cache.
    fn welcome_if_new(&self, node: Node) {
        let stale = {
            let mut router = self.router.lock().unwrap();
            if router.is_new_node(&node.id) {
                debug!(id = ?node.id, addr = %node.addr, "adding node to routing table");
            }
            router.add_contact(node)
        };
        if let Some(stale) = stale {
            let Some(krpc) = self.me.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                match krpc.request(stale.addr, "ping", krpc.our_id_args()).await {
                    Some(_) => {
                        krpc.router.lock().unwrap().add_contact(stale);
                    }
                    None => {
                        krpc.router.lock().unwrap().remove_contact(&stale.id);
                    }
                }
            });
        }
    }
}

/// BEP 5 node IDs are 160-bit; zero is reserved as invalid.
fn valid_node_id(value: &BencodeValue) -> Option<NodeId> {
    let id = NodeId::from_bytes(value.as_bytes()?)?;
    if id.is_zero() {
        return None;
    }
    Some(id)
}
