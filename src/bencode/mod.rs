//! Bencode, the serialization format BitTorrent uses on every wire this
//! crate speaks: tracker bodies, KRPC datagrams, the metadata exchange and
//! the final `.torrent` envelope.
use std::collections::HashMap;
use thiserror::Error;
pub mod decoder;
pub mod encoder;

pub use decoder::{decode, decode_lax, decode_prefix};
pub use encoder::encode_to_vec;

/// A dictionary with raw byte-string keys, as bencode defines them.
pub type Dict = HashMap<Vec<u8>, BencodeValue>;

/// Represents a Bencode value.
///
/// The four variants cover all bencode data kinds:
///
/// 1. `String(Vec<u8>)` - a byte string; stored as raw bytes because
///    bencode strings are not guaranteed to be UTF-8 (info-hashes, peer
///    blobs and piece data all travel as strings).
/// 2. `Integer(i64)` - `i<decimal>e` on the wire.
/// 3. `List(Vec<BencodeValue>)` - `l...e` on the wire.
/// 4. `Dict(HashMap<Vec<u8>, BencodeValue>)` - `d...e` on the wire; keys
///    are byte strings and must be encoded in ascending order.
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(Dict),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<Dict> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<&[u8]> for BencodeValue {
    fn from(s: &[u8]) -> Self {
        BencodeValue::String(s.to_vec())
    }
}

impl From<Vec<u8>> for BencodeValue {
    fn from(s: Vec<u8>) -> Self {
        BencodeValue::String(s)
    }
}

impl From<i64> for BencodeValue {
    fn from(i: i64) -> Self {
        BencodeValue::Integer(i)
    }
}

/// Custom error type for Bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("Invalid integer format")]
    InvalidInteger,

    #[error("Invalid string length")]
    InvalidStringLength,

    #[error("Unexpected end of input")]
    UnexpectedEOI,

    #[error("Trailing data after value")]
    TrailingData,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
