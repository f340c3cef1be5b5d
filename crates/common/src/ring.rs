//! # Ring Identifiers
//!
//! 160-bit Chord identifiers over `Z_{2^160}`.
//!
//! A node's stable identifier is `SHA1("ip:port")` interpreted as an
//! unsigned big-endian 160-bit integer. [`ChordId`] stores the raw 20
//! bytes; because the encoding is big-endian, the derived lexicographic
//! byte ordering equals numeric ordering on the ring, so `Ord` works
//! directly for interval checks.
//!
//! On the wire (JSON bodies and HTTP query parameters) identifiers travel
//! as 40-character lowercase hex.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Width of the identifier space in bits. SHA-1 output.
pub const RING_BITS: usize = 160;

/// Identifier size in bytes.
pub const ID_SIZE: usize = RING_BITS / 8;

/// A 160-bit position on the Chord ring.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChordId([u8; ID_SIZE]);

impl ChordId {
    /// Derives the ring identifier for a node endpoint: `SHA1("ip:port")`.
    pub fn of_endpoint(ip: &str, port: u16) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{}:{}", ip, port).as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Builds an identifier from raw bytes. Inputs shorter than 20 bytes
    /// are right-aligned (treated as a small integer); longer inputs are
    /// truncated to the low-order 20 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; ID_SIZE];
        if bytes.len() >= ID_SIZE {
            id.copy_from_slice(&bytes[bytes.len() - ID_SIZE..]);
        } else {
            id[ID_SIZE - bytes.len()..].copy_from_slice(bytes);
        }
        Self(id)
    }

    /// Parses the 40-character hex wire form. Shorter hex strings are
    /// accepted and right-aligned, so small test identifiers like `"05"`
    /// work too.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let padded = if s.len() % 2 == 1 {
            format!("0{}", s)
        } else {
            s.to_string()
        };
        let bytes = hex::decode(padded)?;
        Ok(Self::from_bytes(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// `self + 2^i (mod 2^160)` — the start of finger `i`.
    ///
    /// Byte-wise addition with carry; overflow past bit 159 wraps, which
    /// is exactly the modular semantics the ring needs.
    pub fn add_pow2(&self, i: usize) -> Self {
        debug_assert!(i < RING_BITS);
        let mut out = self.0;
        let byte = ID_SIZE - 1 - i / 8;
        let mut carry = 1u16 << (i % 8);
        let mut idx = byte as isize;
        while carry > 0 && idx >= 0 {
            let sum = out[idx as usize] as u16 + carry;
            out[idx as usize] = (sum & 0xff) as u8;
            carry = sum >> 8;
            idx -= 1;
        }
        Self(out)
    }

    /// Decimal value mod 10000, the short form used in logs and `/status`.
    pub fn short(&self) -> u64 {
        self.0
            .iter()
            .fold(0u64, |acc, &b| (acc * 256 + b as u64) % 10_000)
    }
}

/// `(start, end]` membership on the ring with wrap-around.
///
/// When `start == end` the interval is the whole ring minus the point
/// itself: `id == start` is outside, everything else is inside. This is
/// the ring-of-one rule the overlay relies on.
pub fn is_between(start: &ChordId, id: &ChordId, end: &ChordId) -> bool {
    if start == end {
        return id != start;
    }
    if start < end {
        start < id && id <= end
    } else {
        start < id || id <= end
    }
}

impl std::fmt::Debug for ChordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChordId({}…)", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for ChordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ChordId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChordId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChordId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ChordId {
        ChordId::from_bytes(&n.to_be_bytes())
    }

    #[test]
    fn test_endpoint_id_is_stable() {
        let a = ChordId::of_endpoint("127.0.0.1", 5000);
        let b = ChordId::of_endpoint("127.0.0.1", 5000);
        assert_eq!(a, b);
        assert_ne!(a, ChordId::of_endpoint("127.0.0.1", 5001));
    }

    #[test]
    fn test_endpoint_id_matches_sha1() {
        // SHA1("127.0.0.1:5000") spelled out through the hasher, to pin
        // the exact preimage format.
        let mut hasher = Sha1::new();
        hasher.update(b"127.0.0.1:5000");
        let expected = hex::encode(hasher.finalize());
        assert_eq!(ChordId::of_endpoint("127.0.0.1", 5000).to_hex(), expected);
    }

    #[test]
    fn test_hex_round_trip() {
        let a = ChordId::of_endpoint("10.0.0.1", 8000);
        let parsed = ChordId::from_hex(&a.to_hex()).unwrap();
        assert_eq!(a, parsed);
    }

    #[test]
    fn test_short_hex_right_aligned() {
        assert_eq!(ChordId::from_hex("05").unwrap(), id(5));
        assert_eq!(ChordId::from_hex("5").unwrap(), id(5));
    }

    #[test]
    fn test_ordering_is_numeric() {
        assert!(id(3) < id(4));
        assert!(id(255) < id(256));
        assert!(id(u64::MAX - 1) < id(u64::MAX));
    }

    #[test]
    fn test_add_pow2_low_bits() {
        assert_eq!(id(0).add_pow2(0), id(1));
        assert_eq!(id(0).add_pow2(7), id(128));
        assert_eq!(id(1).add_pow2(8), id(257));
    }

    #[test]
    fn test_add_pow2_carry_propagation() {
        assert_eq!(id(255).add_pow2(0), id(256));
        assert_eq!(id(0xffff).add_pow2(0), id(0x1_0000));
    }

    #[test]
    fn test_add_pow2_wraps_at_ring_top() {
        // 2^159 + 2^159 = 2^160 ≡ 0 (mod 2^160)
        let half = ChordId::from_bytes(&{
            let mut b = [0u8; ID_SIZE];
            b[0] = 0x80;
            b
        });
        assert_eq!(half.add_pow2(159), id(0));
    }

    #[test]
    fn test_is_between_no_wrap() {
        assert!(is_between(&id(10), &id(15), &id(20)));
        assert!(is_between(&id(10), &id(20), &id(20)));
        assert!(!is_between(&id(10), &id(10), &id(20)));
        assert!(!is_between(&id(10), &id(21), &id(20)));
    }

    #[test]
    fn test_is_between_wrap() {
        // Interval (200, 20] crosses zero.
        assert!(is_between(&id(200), &id(250), &id(20)));
        assert!(is_between(&id(200), &id(5), &id(20)));
        assert!(is_between(&id(200), &id(20), &id(20)));
        assert!(!is_between(&id(200), &id(100), &id(20)));
        assert!(!is_between(&id(200), &id(200), &id(20)));
    }

    #[test]
    fn test_is_between_ring_of_one() {
        // start == end: everything except the point itself is inside.
        assert!(!is_between(&id(7), &id(7), &id(7)));
        assert!(is_between(&id(7), &id(8), &id(7)));
        assert!(is_between(&id(7), &id(0), &id(7)));
    }

    #[test]
    fn test_short_mod_10000() {
        assert_eq!(id(12345).short(), 2345);
        assert_eq!(id(9999).short(), 9999);
        assert_eq!(id(10000).short(), 0);
    }

    #[test]
    fn test_serde_hex_form() {
        let a = ChordId::of_endpoint("127.0.0.1", 5000);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, format!("\"{}\"", a.to_hex()));
        let back: ChordId = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}
