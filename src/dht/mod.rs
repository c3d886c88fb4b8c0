//! Mainline DHT (BEP 5): Kademlia routing, KRPC over UDP with bencode,
//! and the iterative lookups that turn an info-hash into peer addresses.
pub mod krpc;
pub mod node;
pub mod routing;
pub mod server;
pub mod spider;
pub mod storage;

pub use node::Node;
pub use node::NodeId;
pub use server::DhtServer;
pub use server::DhtState;
pub use server::PeerStream;
