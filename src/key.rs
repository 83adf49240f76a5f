//! Key-to-bytes encoding.
//!
//! The trie orders entries by the lexicographic order of their encoded
//! bytes, so every encoding here is chosen to make byte order equal key
//! order: strings and byte vectors map identically, unsigned integers map
//! to their big-endian representation, and signed integers flip the sign
//! bit before the big-endian conversion so that negative values sort
//! before positive ones across the full range.

/// Byte encoding for trie keys.
///
/// `FIXED_LEN` is `0` for variable-length keys and the exact encoded
/// length otherwise. Fixed-length encodings must always produce exactly
/// `FIXED_LEN` bytes.
pub trait TrieKey {
    /// Encoded length for fixed-length keys, `0` for variable-length.
    const FIXED_LEN: usize = 0;

    /// Appends the encoded key bytes to `out`.
    fn encode_into(&self, out: &mut Vec<u8>);

    /// Reconstructs a key from its encoded bytes.
    fn decode(bytes: &[u8]) -> Self
    where
        Self: Sized;

    /// Convenience wrapper returning a fresh encoding.
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(if Self::FIXED_LEN > 0 { Self::FIXED_LEN } else { 16 });
        self.encode_into(&mut out);
        out
    }
}

impl TrieKey for String {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl TrieKey for Vec<u8> {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes.to_vec()
    }
}

impl<const N: usize> TrieKey for [u8; N] {
    const FIXED_LEN: usize = N;

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut arr = [0u8; N];
        arr.copy_from_slice(bytes);
        arr
    }
}

macro_rules! unsigned_key {
    ($($t:ty),*) => {
        $(
            impl TrieKey for $t {
                const FIXED_LEN: usize = core::mem::size_of::<$t>();

                fn encode_into(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_be_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; core::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_be_bytes(buf)
                }
            }
        )*
    };
}

macro_rules! signed_key {
    ($($t:ty => $u:ty),*) => {
        $(
            impl TrieKey for $t {
                const FIXED_LEN: usize = core::mem::size_of::<$t>();

                fn encode_into(&self, out: &mut Vec<u8>) {
                    const SIGN: $u = 1 << (<$u>::BITS - 1);
                    let sortable = (*self as $u) ^ SIGN;
                    out.extend_from_slice(&sortable.to_be_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    const SIGN: $u = 1 << (<$u>::BITS - 1);
                    let mut buf = [0u8; core::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    (<$u>::from_be_bytes(buf) ^ SIGN) as $t
                }
            }
        )*
    };
}

unsigned_key!(u8, u16, u32, u64, u128);
signed_key!(i8 => u8, i16 => u16, i32 => u32, i64 => u64, i128 => u128);

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<K: TrieKey + PartialEq + core::fmt::Debug>(k: K) {
        let bytes = k.encode();
        if K::FIXED_LEN > 0 {
            assert_eq!(bytes.len(), K::FIXED_LEN);
        }
        assert_eq!(K::decode(&bytes), k);
    }

    #[test]
    fn integer_roundtrip() {
        roundtrip(0u64);
        roundtrip(u64::MAX);
        roundtrip(0i64);
        roundtrip(-1i64);
        roundtrip(i64::MIN);
        roundtrip(i64::MAX);
        roundtrip(-1_000_000i32);
        roundtrip(String::from("hello"));
        roundtrip(vec![0u8, 255, 3]);
    }

    #[test]
    fn signed_order_matches_byte_order() {
        let keys = [i64::MIN, -1_000_000, -1, 0, 1, 1_000_000, i64::MAX];
        let encoded: Vec<Vec<u8>> = keys.iter().map(|k| k.encode()).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[cfg(feature = "proptest")]
    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn i64_order_preserved(a in any::<i64>(), b in any::<i64>()) {
                let (ea, eb) = (a.encode(), b.encode());
                prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
            }

            #[test]
            fn u32_order_preserved(a in any::<u32>(), b in any::<u32>()) {
                let (ea, eb) = (a.encode(), b.encode());
                prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
            }
        }
    }
}
