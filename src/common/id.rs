//! Node identifiers, lookup targets and message correlation ids.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// The size of node ids in bytes.
pub const ID_LENGTH: usize = 32;

/// The number of k-buckets in a routing table, one per possible
/// most-significant differing bit.
pub const BUCKET_COUNT: usize = ID_LENGTH * 8;

/// The size of message correlation ids in bytes.
pub const MESSAGE_ID_LENGTH: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A 256-bit node id or lookup target.
///
/// Ids compare by big-endian lexicographic byte order, so
/// `a.xor(&target) < b.xor(&target)` means `a` is closer to `target`.
pub struct Id(pub(crate) [u8; ID_LENGTH]);

impl Id {
    /// Generate a fresh id by digesting a random seed, which keeps the
    /// distribution uniform even with a weak entropy source.
    pub fn random() -> Id {
        let seed: [u8; ID_LENGTH] = rand::thread_rng().gen();

        Id(Sha256::digest(seed).into())
    }

    /// Create an [Id] from some bytes. Returns Err if `bytes` is not
    /// [ID_LENGTH] long.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_LENGTH {
            return Err(Error::InvalidIdLength(bytes.len()));
        }

        let mut tmp = [0u8; ID_LENGTH];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Byte-wise XOR with another id, the Kademlia distance metric.
    pub fn xor(&self, other: &Id) -> Id {
        let mut out = [0u8; ID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(out)
    }

    /// The index of the bucket `other` belongs to relative to this id:
    /// the position of the most significant set bit of the XOR of the
    /// two, where 0 is the leftmost bit.
    ///
    /// Returns None for identical ids, which belong to no bucket.
    pub fn bucket_index(&self, other: &Id) -> Option<u8> {
        for i in 0..ID_LENGTH {
            let xor = self.0[i] ^ other.0[i];

            if xor != 0 {
                return Some((i as u32 * 8 + xor.leading_zeros()) as u8);
            }
        }

        None
    }
}

/// Map arbitrary user key bytes into the id space.
pub fn key_id(key: &[u8]) -> Id {
    Id(Sha256::digest(key).into())
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        Id::from_bytes(hex::decode(s)?)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// Random 8-byte id correlating one outgoing request with its response.
pub struct MessageId(pub(crate) [u8; MESSAGE_ID_LENGTH]);

impl MessageId {
    pub fn random() -> MessageId {
        MessageId(rand::thread_rng().gen())
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_ID_LENGTH]) -> MessageId {
        MessageId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LENGTH] {
        &self.0
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}
