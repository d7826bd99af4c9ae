//! Kademlia node Id or a lookup target
use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;

use crate::{Error, Result};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Bitwise XOR of two ids.
    ///
    /// Compared as unsigned 160-bit big-endian integers (the derived `Ord` on
    /// the byte array), the result is the Kademlia distance metric.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Count of leading bits shared with `other` (0..=160).
    ///
    /// Equal ids share all 160 bits.
    pub fn common_prefix_len(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let xor = self.0[i] ^ other.0[i];

            if xor != 0 {
                return (i as u32 * 8 + xor.leading_zeros()) as u8;
            }
        }

        ID_BITS as u8
    }

    /// The routing table bucket `other` belongs to, relative to this (local) id.
    ///
    /// Defined as the common prefix length, in `0..=159`. Undefined when
    /// `other == self`; callers must exclude that case.
    pub fn bucket_index(&self, other: &Id) -> u8 {
        self.common_prefix_len(other)
    }

    /// Random id sharing exactly `bucket` leading bits with this id.
    ///
    /// Used to pick refresh targets that land inside a specific bucket.
    pub fn random_in_bucket(&self, bucket: u8) -> Id {
        let mut bytes = Id::random().0;

        let whole = bucket as usize / 8;
        let rem = bucket as usize % 8;

        bytes[..whole].copy_from_slice(&self.0[..whole]);

        // Mix the boundary byte: shared high bits from self, a forced
        // divergence at bit `rem`, random low bits.
        let keep = if rem == 0 { 0 } else { 0xff_u8 << (8 - rem) };
        let diverge = 0x80_u8 >> rem;
        bytes[whole] = (self.0[whole] & keep) | ((!self.0[whole]) & diverge) | (bytes[whole] & !(keep | diverge));

        Id(bytes)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdEncoding(s.into()));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.into()))?;
        }

        Ok(Id(bytes))
    }
}

impl TryFrom<&str> for Id {
    type Error = Error;

    fn try_from(s: &str) -> Result<Id> {
        Id::from_str(s)
    }
}
