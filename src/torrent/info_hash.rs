use sha1::Digest;
use sha1::Sha1;
use std::fmt;

/// The 20-byte SHA-1 digest of a bencoded `info` dictionary; the identity
/// of a torrent in the swarm.
///
/// Magnet links carry it either as 40 hex characters or as 32 characters
/// of RFC 4648 base32; every other length is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Hashes raw bencoded `info` bytes.
    pub fn of_bencoded(info: &[u8]) -> Self {
        let digest = Sha1::digest(info);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        InfoHash(hash)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }

    pub fn from_base32(s: &str) -> Option<Self> {
        let bytes = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, s)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 20] = bytes.try_into().ok()?;
        Some(InfoHash(array))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form, used for display names and cache paths.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Relative cache location `<hex[0:2]>/<hex[2:4]>/<hex>`.
    pub fn cache_path(&self) -> String {
        let hex = self.hex();
        format!("{}/{}/{}", &hex[0..2], &hex[2..4], hex)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_base32_forms_agree() {
        let from_hex = InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap();
        let from_b32 = InfoHash::from_base32("AERUKZ4JVPG66AJDIVTYTK6N54ASGRLH").unwrap();
        assert_eq!(from_hex.hex(), "0123456789abcdef0123456789abcdef01234567");
        assert_eq!(from_b32, from_hex);

        let other = InfoHash::from_base32("AIJDIZ3HE7AH4ATSITBHTI6V4D54GI2H").unwrap();
        assert_eq!(other.hex(), "021234676727c07e027244c279a3d5e0fbc32347");
    }

    #[test]
    fn rejects_wrong_lengths() {
        assert!(InfoHash::from_hex("abcd").is_none());
        assert!(InfoHash::from_bytes(&[0u8; 19]).is_none());
        assert!(InfoHash::from_bytes(&[0u8; 21]).is_none());
    }

    #[test]
    fn digests_bencoded_info() {
        let hash = InfoHash::of_bencoded(b"d4:name5:helloe");
        assert_eq!(hash.as_bytes(), &Sha1::digest(b"d4:name5:helloe")[..]);
    }

    #[test]
    fn cache_path_shards_by_hex_prefix() {
        let hash = InfoHash([0xab; 20]);
        let path = hash.cache_path();
        assert!(path.starts_with("ab/ab/abab"));
        assert_eq!(path.len(), 2 + 1 + 2 + 1 + 40);
    }
}
