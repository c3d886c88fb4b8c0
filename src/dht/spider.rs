//! Iterative Kademlia lookups: crawl toward a target ID with bounded
//! concurrency, following each response's `nodes` closer to the target.
use super::krpc::Krpc;
use super::node::Node;
use super::node::NodeHeap;
use super::node::NodeId;
use crate::bencode::Dict;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Finds the `ksize` nodes nearest `target`; used by bootstrap and the
/// periodic bucket refresh.
pub async fn node_spider(
    krpc: Arc<Krpc>,
    target: NodeId,
    seeds: Vec<Node>,
    ksize: usize,
    alpha: usize,
    cancel: CancellationToken,
) -> Vec<Node> {
    crawl(krpc, target, seeds, ksize, alpha, cancel, None).await
}

/// Streams batches of peers for an info-hash while the crawl runs, so
/// the caller can start contacting peers before the lookup concludes.
///
/// Exactly one terminal empty batch is pushed per invocation, whether the
/// crawl drains naturally or is cancelled.
pub async fn peer_spider(
    krpc: Arc<Krpc>,
    info_hash: NodeId,
    seeds: Vec<Node>,
    ksize: usize,
    alpha: usize,
    cancel: CancellationToken,
    batches: UnboundedSender<Vec<SocketAddrV4>>,
) {
    crawl(
        krpc,
        info_hash,
        seeds,
        ksize,
        alpha,
        cancel,
        Some(&batches),
    )
    .await;
    let _ = batches.send(Vec::new());
}

/// The shared crawl loop.
///
/// Keeps at most `alpha` RPCs in flight. Every completion either merges
/// the responder's `nodes` into the heap (trimmed to `ksize`) or, on
/// silence, drops the responder. The crawl ends when every heap member
/// has been contacted and nothing is in flight, or on cancellation, which
/// also aborts the in-flight RPCs.
async fn crawl(
    krpc: Arc<Krpc>,
    target: NodeId,
    seeds: Vec<Node>,
    ksize: usize,
    alpha: usize,
    cancel: CancellationToken,
    batches: Option<&UnboundedSender<Vec<SocketAddrV4>>>,
) -> Vec<Node> {
    debug!(target = ?target, seeds = seeds.len(), "starting crawl");
    let mut nearest = NodeHeap::new(target, ksize);
    nearest.push(seeds);

    let mut in_flight = FuturesUnordered::new();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        while in_flight.len() < alpha {
            let Some(node) = nearest.next_uncontacted() else {
                break;
            };
            nearest.mark_contacted(&node.id);
            let krpc = Arc::clone(&krpc);
            let for_peers = batches.is_some();
            in_flight.push(async move {
                let response = if for_peers {
                    krpc.call_get_peers(&node, &target).await
                } else {
                    krpc.call_find_node(&node, &target).await
                };
                (node, response)
            });
        }
        if in_flight.is_empty() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            completed = in_flight.next() => {
                let Some((node, response)) = completed else { break };
                match response {
                    None => nearest.remove(&node.id),
                    Some(args) => {
                        if let Some(batches) = batches {
                            let peers = peer_values(&args);
                            if !peers.is_empty() {
                                let _ = batches.send(peers);
                                continue;
                            }
                        }
                        nearest.push(compact_nodes(&args));
                    }
                }
            }
        }
    }

    // dropping the set aborts any RPC still waiting
    drop(in_flight);
    nearest.closest()
}

/// Parses the 26-byte-per-entry `nodes` blob of a response.
pub fn compact_nodes(args: &Dict) -> Vec<Node> {
    args.get(b"nodes".as_slice())
        .and_then(|v| v.as_bytes())
        .map(|blob| blob.chunks_exact(26).filter_map(Node::from_compact).collect())
        .unwrap_or_default()
}

/// Parses the `values` list of a response: 6-byte compact peers.
pub fn peer_values(args: &Dict) -> Vec<SocketAddrV4> {
    args.get(b"values".as_slice())
        .and_then(|v| v.as_list())
        .map(|values| {
            values
                .iter()
                .filter_map(|value| {
                    let bytes = value.as_bytes()?;
                    if bytes.len() != 6 {
                        return None;
                    }
                    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
                    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
                    Some(SocketAddrV4::new(ip, port))
                })
                .collect()
        })
        .unwrap_or_default()
}
