//! Library root for magfetch.
//!
//! Turns magnet links into `.torrent` files by racing trackers and the
//! mainline DHT for peers and pulling the `info` dictionary straight
//! from the swarm over the metadata-exchange extension.
pub mod bencode;
pub mod config;
pub mod dht;
pub mod fetch;
pub mod magnet;
pub mod peer;
pub mod server;
pub mod torrent;
pub mod tracker;
