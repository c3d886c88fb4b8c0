//! Torrent envelope construction and error handling logic.
//!
//! The output of a fetch is a `.torrent` file: the swarm-verified `info`
//! dictionary wrapped together with the tracker list the magnet supplied.
use crate::bencode;
use crate::bencode::BencodeValue;
use crate::bencode::Dict;
use thiserror::Error;
pub mod info_hash;

pub use info_hash::InfoHash;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent format: {0}")]
    InvalidFormat(String),
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;

/// Wraps verified `info` bytes into a bencoded torrent envelope.
///
/// The envelope is `{info, announce-list, announce}` where
/// `announce-list` holds one single-tracker tier per tracker (in the
/// order the magnet supplied them) and `announce` is the first tracker.
/// With no trackers the envelope is `{info}` alone.
pub fn build_torrent(info: &[u8], trackers: &[String]) -> TorrentResult<Vec<u8>> {
    let info_value = bencode::decode(info)?;
    if info_value.as_dict().is_none() {
        return Err(TorrentError::InvalidFormat(
            "info is not a dictionary".to_string(),
        ));
    }

    let mut torrent = Dict::new();
    torrent.insert(b"info".to_vec(), info_value);

    if let Some(first) = trackers.first() {
        let tiers = trackers
            .iter()
            .map(|tracker| BencodeValue::List(vec![tracker.as_bytes().into()]))
            .collect();
        torrent.insert(b"announce-list".to_vec(), BencodeValue::List(tiers));
        torrent.insert(b"announce".to_vec(), first.as_bytes().into());
    }

    Ok(bencode::encode_to_vec(&BencodeValue::Dict(torrent))?)
}
