//! Magnet URI parsing.
//!
//! A magnet link carries at minimum the info-hash (`xt=urn:btih:...`),
//! and optionally tracker URLs (`tr=`) and a display name (`dn=`).
use crate::torrent::InfoHash;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum MagnetError {
    #[error("Not a valid magnet URI: {0}")]
    InvalidUri(#[from] url::ParseError),

    #[error("Magnet URI is missing an xt=urn:btih: parameter")]
    MissingInfoHash,

    #[error("Unable to parse infohash")]
    InvalidInfoHash,
}

/// A parsed magnet link.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub trackers: Vec<String>,
    display_name: Option<String>,
}

impl MagnetLink {
    /// Parses `magnet:?xt=urn:btih:<hex40|base32>&tr=<url>*&dn=<name>?`.
    ///
    /// The info-hash must be 40 hex characters or 32 base32 characters;
    /// any other length fails. Multiple `tr` parameters accumulate in
    /// order.
    pub fn parse(link: &str) -> Result<Self, MagnetError> {
        let url = Url::parse(link)?;
        if url.scheme() != "magnet" {
            return Err(MagnetError::MissingInfoHash);
        }

        let mut info_hash = None;
        let mut trackers = Vec::new();
        let mut display_name = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    let blob = value
                        .strip_prefix("urn:btih:")
                        .ok_or(MagnetError::MissingInfoHash)?;
                    let parsed = match blob.len() {
                        40 => InfoHash::from_hex(blob),
                        32 => InfoHash::from_base32(blob),
                        _ => None,
                    };
                    info_hash = Some(parsed.ok_or(MagnetError::InvalidInfoHash)?);
                }
                "tr" => trackers.push(value.into_owned()),
                "dn" if display_name.is_none() => display_name = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            trackers,
            display_name,
        })
    }

    /// The display name, sanitized for use as a filename: leading and
    /// trailing dots stripped, path and drive separators removed. Falls
    /// back to the info-hash in lowercase hex.
    pub fn name(&self) -> String {
        match &self.display_name {
            Some(name) => name
                .trim_matches('.')
                .chars()
                .filter(|c| !matches!(c, '/' | '\\' | ':'))
                .collect(),
            None => self.info_hash.hex(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_magnet() {
        let magnet = MagnetLink::parse(
            "magnet:?xt=urn:btih:0123456789ABCDEF0123456789ABCDEF01234567&dn=hello",
        )
        .unwrap();
        assert_eq!(
            magnet.info_hash.hex(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(magnet.name(), "hello");
        assert!(magnet.trackers.is_empty());
    }

    #[test]
    fn parses_base32_magnet_and_defaults_name_to_hex() {
        let magnet =
            MagnetLink::parse("magnet:?xt=urn:btih:AIJDIZ3HE7AH4ATSITBHTI6V4D54GI2H").unwrap();
        assert_eq!(
            magnet.info_hash.hex(),
            "021234676727c07e027244c279a3d5e0fbc32347"
        );
        assert_eq!(magnet.name(), magnet.info_hash.hex());
    }

    #[test]
    fn collects_trackers_in_order() {
        let magnet = MagnetLink::parse(
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567\
             &tr=http%3A%2F%2Fone%2Fannounce&tr=udp%3A%2F%2Ftwo%3A6969%2Fannounce",
        )
        .unwrap();
        assert_eq!(
            magnet.trackers,
            vec!["http://one/announce", "udp://two:6969/announce"]
        );
    }

    #[test]
    fn rejects_bad_hash_lengths() {
        assert!(matches!(
            MagnetLink::parse("magnet:?xt=urn:btih:abcdef"),
            Err(MagnetError::InvalidInfoHash)
        ));
        assert!(matches!(
            MagnetLink::parse("magnet:?dn=nothing"),
            Err(MagnetError::MissingInfoHash)
        ));
    }

    #[test]
    fn sanitizes_display_name() {
        let magnet = MagnetLink::parse(
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=..a%2Fb%5Cc%3Ad..",
        )
        .unwrap();
        assert_eq!(magnet.name(), "abcd");
    }
}
