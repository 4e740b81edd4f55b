use serde_derive::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter, Result};

use crate::KEY_LENGTH;

/// A 160-bit identifier for nodes and content.
///
/// Keys are compared big-endian, so the byte at index zero carries the most
/// significant bits of the identifier space.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Serialize, Deserialize, Default, Copy)]
pub struct Key(pub [u8; KEY_LENGTH]);

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let hex_vec: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", hex_vec.join(""))
    }
}

impl Key {
    /// Constructs a new `Key` from a byte array.
    pub fn new(data: [u8; KEY_LENGTH]) -> Self {
        Key(data)
    }

    /// Constructs a new, random `Key`.
    pub fn rand() -> Self {
        let mut ret = Key([0; KEY_LENGTH]);
        for byte in &mut ret.0 {
            *byte = rand::random::<u8>();
        }
        ret
    }

    /// Returns the XOR distance between `self` and `key`.
    pub fn distance(&self, key: &Key) -> Key {
        let mut ret = [0; KEY_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ key.0[i];
        }
        Key(ret)
    }

    /// Returns the number of leading zero bits in `self`, or `KEY_LENGTH * 8`
    /// for the zero key. The leading zeros of the distance between two keys
    /// is the index of the bucket the remote key belongs to.
    pub fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for i in 0..KEY_LENGTH {
            if self.0[i] == 0 {
                ret += 8
            } else {
                return ret + self.0[i].leading_zeros() as usize;
            }
        }
        ret
    }

    /// Constructs a random `Key` whose distance to `local` has its first set
    /// bit exactly at `index`, i.e. a key that falls into bucket `index` of a
    /// table whose local identifier is `local`.
    ///
    /// Bits strictly before `index` are copied from `local`, bit `index` is
    /// forced to the opposite of `local`'s, and every later bit stays random.
    pub fn rand_in_bucket(index: usize, local: &Key) -> Self {
        let mut ret = Key::rand();
        let byte = index / 8;
        let bit = index % 8;

        ret.0[..byte].copy_from_slice(&local.0[..byte]);

        // within the boundary byte, the bits above `bit` come from `local`
        let mask = !(0xFFu8 >> bit);
        ret.0[byte] = (local.0[byte] & mask) | (ret.0[byte] & !mask);

        let flip = 0x80u8 >> bit;
        if local.0[byte] & flip == 0 {
            ret.0[byte] |= flip;
        } else {
            ret.0[byte] &= !flip;
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use super::Key;
    use crate::KEY_LENGTH;

    #[test]
    fn test_distance_with_self_is_zero() {
        let key = Key::rand();
        assert_eq!(key.distance(&key), Key([0; KEY_LENGTH]));
        assert_eq!(key.distance(&key).leading_zeros(), KEY_LENGTH * 8);
    }

    #[test]
    fn test_leading_zeros() {
        for i in 0..KEY_LENGTH * 8 {
            let mut data = [0u8; KEY_LENGTH];
            data[i / 8] = 0x80 >> (i % 8);
            assert_eq!(Key::new(data).leading_zeros(), i);
        }
    }

    #[test]
    fn test_rand_in_bucket_first_set_bit() {
        for _ in 0..8 {
            let local = Key::rand();
            for i in 0..KEY_LENGTH * 8 {
                let key = Key::rand_in_bucket(i, &local);
                assert_eq!(key.distance(&local).leading_zeros(), i);
            }
        }
    }

    #[test]
    fn test_rand_in_bucket_distance_range() {
        let local = Key::rand();
        for i in 0..KEY_LENGTH * 8 {
            let distance = Key::rand_in_bucket(i, &local).distance(&local);
            let distance = BigUint::from_bytes_be(&distance.0);
            let mut lower = [0u8; KEY_LENGTH];
            lower[i / 8] = 0x80 >> (i % 8);
            let lower = BigUint::from_bytes_be(&lower);
            assert!(lower <= distance);
            assert!(distance < (lower << 1usize));
        }
    }
}
