#![warn(missing_docs)]

//! Ring identifiers.
//!
//! A [Key] is a point on the cyclic group of identifiers mod 2^160, wrapped
//! around `H160`. Addition and negation are closed over the ring, so
//! `a - b` is the clockwise distance from `b` to `a`. There is no global
//! order between two keys; ordering only exists relative to an observation
//! point, which [BiasKey] makes explicit by re-basing a key on a chosen
//! origin. All arc membership tests are built from that relative distance.

use std::cmp::PartialEq;
use std::ops::Add;
use std::ops::Deref;
use std::ops::Neg;
use std::ops::Sub;
use std::str::FromStr;

use ethereum_types::H160;
use num_bigint::BigUint;
use rand::RngCore;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

/// Key is a finite ring R(P) where P = 2^160, wrap H160.
#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd, Debug, Serialize, Deserialize, Hash)]
pub struct Key(H160);

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let inner = &self.0;
        write!(f, "0x{inner:x}")
    }
}

/// A [Key] observed from a chosen origin on the ring.
/// Two keys cannot be compared directly, but their clockwise distances from
/// a common origin can. `BiasKey` stores that distance, so `Ord` on it means
/// "closer to the origin clockwise".
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct BiasKey {
    /// The zero point used for the observation.
    origin: Key,
    /// Clockwise distance from the origin.
    dist: Key,
}

impl BiasKey {
    /// Observe `key` from `origin`.
    pub fn new(origin: Key, key: Key) -> BiasKey {
        BiasKey {
            origin,
            dist: key - origin,
        }
    }

    /// Recover the plain key.
    pub fn to_key(self) -> Key {
        self.dist + self.origin
    }

    /// Clockwise distance from the origin.
    pub fn pos(&self) -> Key {
        self.dist
    }
}

impl PartialOrd for BiasKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BiasKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if other.origin != self.origin {
            let rebased = BiasKey::new(self.origin, other.to_key());
            self.dist.cmp(&rebased.dist)
        } else {
            self.dist.cmp(&other.dist)
        }
    }
}

impl From<BiasKey> for Key {
    fn from(bk: BiasKey) -> Key {
        bk.to_key()
    }
}

impl Key {
    /// Observe this key from `origin`, for relative ordering.
    pub fn bias(&self, origin: Key) -> BiasKey {
        BiasKey::new(origin, *self)
    }

    /// Test membership of the open clockwise arc (lo, hi).
    /// When lo == hi the arc is the whole ring minus lo. Both endpoints are
    /// excluded.
    pub fn between(&self, lo: Key, hi: Key) -> bool {
        *self != lo && (lo == hi || (*self - lo) < (hi - lo))
    }

    /// Test membership of the left-open clockwise arc (lo, hi].
    pub fn between_left_open(&self, lo: Key, hi: Key) -> bool {
        *self == hi || self.between(lo, hi)
    }

    /// Number of set bits. A fresh ring id is non-zero with overwhelming
    /// probability, so a zero count marks an unset key on the wire.
    pub fn count(&self) -> u32 {
        self.0.as_bytes().iter().map(|b| b.count_ones()).sum()
    }

    /// Draw a fresh ring id from the thread CSPRNG.
    pub fn random() -> Key {
        let mut buf = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut buf);
        Key(H160::from(buf))
    }
}

/// Ordering with a key reference.
/// This trait defines the necessary method for sorting based on a key.
pub trait SortRing {
    /// Sort entries by clockwise distance from `origin`.
    fn sort(&mut self, origin: Key);
}

impl SortRing for Vec<Key> {
    fn sort(&mut self, origin: Key) {
        self.sort_by(|a, b| {
            let (da, db) = (*a - origin, *b - origin);
            da.cmp(&db)
        });
    }
}

impl Deref for Key {
    type Target = H160;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Key> for H160 {
    fn from(key: Key) -> Self {
        key.0.to_owned()
    }
}

impl From<H160> for Key {
    fn from(h: H160) -> Self {
        Self(h)
    }
}

impl From<Key> for BigUint {
    fn from(key: Key) -> BigUint {
        BigUint::from_bytes_be(key.as_bytes())
    }
}

impl From<BigUint> for Key {
    fn from(n: BigUint) -> Self {
        let wrapped = n % (BigUint::from(2u16).pow(160));
        let mut tail: Vec<u8> = wrapped.to_bytes_be();
        let mut bytes = vec![0u8; 20 - tail.len()];
        bytes.append(&mut tail);
        Self(H160::from_slice(&bytes))
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Key {
        Self::from(BigUint::from(n))
    }
}

impl FromStr for Key {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(
            H160::from_str(s).map_err(|_| Error::BadHexKey(s.to_string()))?,
        ))
    }
}

// impl finite ring for Key
impl Neg for Key {
    type Output = Self;
    fn neg(self) -> Self {
        let ret = BigUint::from(2u16).pow(160) - BigUint::from(self);
        ret.into()
    }
}

impl Add for Key {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        ((BigUint::from(self) + BigUint::from(rhs)) % (BigUint::from(2u16).pow(160))).into()
    }
}

impl Sub for Key {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self + (-rhs)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_finite_ring_arithmetic() {
        let zero = Key::from(0u32);
        let a = Key::from_str("0x11E807fcc88dD319270493fB2e822e388Fe36ab0").unwrap();
        assert_eq!(-a + a, zero);
        assert_eq!(-(-a), a);
        assert_eq!(Key::from(0u32), Key::from(BigUint::from(2u16).pow(160)));

        // wrap across zero
        let max = Key::from(BigUint::from(2u16).pow(160) - 1u16);
        assert_eq!(max + Key::from(3u32), Key::from(2u32));
        assert_eq!(Key::from(2u32) - Key::from(5u32), max - Key::from(2u32));
    }

    #[test]
    fn test_between_open_arc() {
        let (a, b, c) = (Key::from(2u32), Key::from(6u32), Key::from(10u32));

        assert!(b.between(a, c));
        assert!(!a.between(a, c), "lower endpoint is excluded");
        assert!(!c.between(a, c), "upper endpoint is excluded");

        // wrapping arc (10, 2)
        assert!(Key::from(14u32).between(c, a));
        assert!(Key::from(0u32).between(c, a));
        assert!(!b.between(c, a));

        // degenerate arc (x, x) is the whole ring minus x
        assert!(b.between(a, a));
        assert!(c.between(a, a));
        assert!(!a.between(a, a));
    }

    #[test]
    fn test_between_left_open() {
        let (a, b, c) = (Key::from(2u32), Key::from(6u32), Key::from(10u32));
        assert!(c.between_left_open(a, c), "upper endpoint is included");
        assert!(b.between_left_open(a, c));
        assert!(!a.between_left_open(a, c));
        // degenerate left-open arc covers everything, endpoint included
        assert!(a.between_left_open(a, a));
        assert!(b.between_left_open(a, a));
    }

    #[test]
    fn test_count_and_random() {
        assert_eq!(Key::from(0u32).count(), 0);
        assert_eq!(Key::from(4u32).count(), 1);
        assert_eq!(Key::from(7u32).count(), 3);

        let k1 = Key::random();
        let k2 = Key::random();
        assert!(k1.count() > 0);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_sort_by_bias() {
        let a = Key::from_str("0xaaE807fcc88dD319270493fB2e822e388Fe36ab0").unwrap();
        let b = Key::from_str("0xbb9999cf1046e68e36E1aA2E0E07105eDDD1f08E").unwrap();
        let c = Key::from_str("0xccffee254729296a45a3885639AC7E10F9d54979").unwrap();
        let d = Key::from_str("0xdddfee254729296a45a3885639AC7E10F9d54979").unwrap();
        let mut v = vec![c, b, a, d];
        v.sort(a);
        assert_eq!(v, vec![a, b, c, d]);
        v.sort(c);
        assert_eq!(v, vec![c, d, a, b]);
    }

    #[test]
    fn test_dump_and_load() {
        // The length must be 40.
        assert!(Key::from_str("0x11E807fcc88dD319270493fB2e822e388Fe36ab").is_err());
        assert!(Key::from_str("0x11E807fcc88dD319270493fB2e822e388Fe36ab00").is_err());

        let key = Key::from_str("0x11E807fcc88dD319270493fB2e822e388Fe36ab0").unwrap();
        assert_eq!(
            key.to_string(),
            "0x11e807fcc88dd319270493fb2e822e388fe36ab0"
        );
        assert_eq!(
            serde_json::to_string(&key).unwrap(),
            "\"0x11e807fcc88dd319270493fb2e822e388fe36ab0\""
        );
        let loaded =
            serde_json::from_str::<Key>("\"0x11e807fcc88dd319270493fb2e822e388fe36ab0\"").unwrap();
        assert_eq!(loaded, key);
    }
}
