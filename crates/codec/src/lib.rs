//! Deterministic binary codec for consensus-critical state.
//!
//! Everything that ends up inside a trie node — keys, values, the nodes
//! themselves — goes through this codec, so the encoding must be canonical:
//! two values encode to the same bytes iff they are equal. That rules out
//! maps with unspecified iteration order, floats, and variable-width
//! integer encodings with redundant forms. The format here is deliberately
//! boring: fixed-width big-endian integers, `u32` length prefixes for
//! variable-length data, and single-byte tags for sum types.
//!
//! Decoding tracks the byte offset so that corruption reports point at the
//! failing position rather than just saying "bad bytes".

#![warn(missing_docs)]

use thiserror::Error;

/// Result alias for decode operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors produced while decoding.
///
/// Every variant carries the byte offset at which decoding failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Input ended before the value was complete.
    #[error("unexpected end of input at offset {offset}: needed {needed} more byte(s)")]
    UnexpectedEof {
        /// Offset at which more bytes were required.
        offset: usize,
        /// How many additional bytes were needed.
        needed: usize,
    },

    /// A tag byte did not match any known variant.
    #[error("invalid tag {tag:#04x} at offset {offset}")]
    InvalidTag {
        /// Offset of the offending tag byte.
        offset: usize,
        /// The tag byte that was read.
        tag: u8,
    },

    /// A declared length exceeds the remaining input.
    #[error("declared length {len} at offset {offset} exceeds remaining input")]
    LengthOverflow {
        /// Offset of the length prefix.
        offset: usize,
        /// The declared length.
        len: u64,
    },

    /// Input contained bytes beyond the end of the decoded value.
    #[error("{found} trailing byte(s) after value ending at offset {offset}")]
    TrailingBytes {
        /// Offset where the value ended.
        offset: usize,
        /// Number of unread bytes.
        found: usize,
    },
}

/// A cursor over a byte slice that tracks its offset.
pub struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader over the full slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Current byte offset from the start of the input.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// True when all input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read exactly `n` bytes, advancing the cursor.
    pub fn read_exact(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                offset: self.offset,
                needed: n - self.remaining(),
            });
        }
        let out = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> CodecResult<u8> {
        Ok(self.read_exact(1)?[0])
    }

    /// Read a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let slice = self.read_exact(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Read a `u32` length prefix and validate it against the remaining input.
    ///
    /// Validating up front means a corrupt length prefix fails here with the
    /// prefix's offset instead of allocating and then hitting EOF later.
    pub fn read_len(&mut self) -> CodecResult<usize> {
        let at = self.offset;
        let len = u32::from_be_bytes(self.read_array::<4>()?) as usize;
        if len > self.remaining() {
            return Err(CodecError::LengthOverflow {
                offset: at,
                len: len as u64,
            });
        }
        Ok(len)
    }

    /// Fail unless the input is fully consumed.
    pub fn finish(&self) -> CodecResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes {
                offset: self.offset,
                found: self.remaining(),
            })
        }
    }
}

/// A type with a canonical binary encoding.
///
/// Laws, relied on throughout the state stack:
/// - round-trip: `decode(encode(x)) == Ok(x)`
/// - canonical: `encode(x) == encode(y)` iff `x == y`
pub trait Codec: Sized {
    /// Append the encoding of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>);

    /// Decode a value from the reader, leaving it positioned after the value.
    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self>;

    /// Encode into a fresh buffer.
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Decode a value that must occupy the entire input.
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(bytes);
        let value = Self::decode_from(&mut r)?;
        r.finish()?;
        Ok(value)
    }
}

macro_rules! impl_codec_for_uint {
    ($ty:ty) => {
        impl Codec for $ty {
            fn encode_to(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_be_bytes());
            }

            fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
                Ok(<$ty>::from_be_bytes(r.read_array()?))
            }
        }
    };
}

impl_codec_for_uint!(u8);
impl_codec_for_uint!(u16);
impl_codec_for_uint!(u32);
impl_codec_for_uint!(u64);

impl Codec for bool {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let at = r.offset();
        match r.read_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(CodecError::InvalidTag { offset: at, tag }),
        }
    }
}

impl Codec for [u8; 32] {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        r.read_array()
    }
}

impl Codec for Vec<u8> {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode_to(buf);
        buf.extend_from_slice(self);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let len = r.read_len()?;
        Ok(r.read_exact(len)?.to_vec())
    }
}

impl<T: Codec> Codec for Option<T> {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            None => buf.push(0),
            Some(v) => {
                buf.push(1);
                v.encode_to(buf);
            }
        }
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let at = r.offset();
        match r.read_byte()? {
            0 => Ok(None),
            1 => Ok(Some(T::decode_from(r)?)),
            tag => Err(CodecError::InvalidTag { offset: at, tag }),
        }
    }
}

impl<A: Codec, B: Codec> Codec for (A, B) {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.0.encode_to(buf);
        self.1.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let a = A::decode_from(r)?;
        let b = B::decode_from(r)?;
        Ok((a, b))
    }
}

/// Encode a slice of encodable items with a `u32` count prefix.
///
/// Not a blanket `Codec for Vec<T>` because that would overlap with the
/// raw-bytes `Vec<u8>` impl above.
pub fn encode_seq<T: Codec>(items: &[T], buf: &mut Vec<u8>) {
    (items.len() as u32).encode_to(buf);
    for item in items {
        item.encode_to(buf);
    }
}

/// Decode a `u32`-count-prefixed sequence.
pub fn decode_seq<T: Codec>(r: &mut Reader<'_>) -> CodecResult<Vec<T>> {
    let at = r.offset();
    let count = u32::from_be_bytes(r.read_array::<4>()?) as usize;
    // Each item takes at least one byte, so a count beyond the remaining
    // input is corrupt and must not drive the allocation below.
    if count > r.remaining() {
        return Err(CodecError::LengthOverflow {
            offset: at,
            len: count as u64,
        });
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(T::decode_from(r)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint_roundtrip() {
        for v in [0u64, 1, 255, 256, u64::MAX] {
            assert_eq!(u64::decode(&v.encode()), Ok(v));
        }
        assert_eq!(u32::decode(&7u32.encode()), Ok(7));
        assert_eq!(u8::decode(&0xabu8.encode()), Ok(0xab));
    }

    #[test]
    fn test_uint_is_fixed_width_big_endian() {
        assert_eq!(1u64.encode(), vec![0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(0x0102u16.encode(), vec![1, 2]);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let v: Vec<u8> = vec![1, 2, 3];
        assert_eq!(Vec::<u8>::decode(&v.encode()), Ok(v));
        let empty: Vec<u8> = vec![];
        assert_eq!(Vec::<u8>::decode(&empty.encode()), Ok(empty));
    }

    #[test]
    fn test_option_roundtrip() {
        assert_eq!(Option::<u32>::decode(&Some(9u32).encode()), Ok(Some(9)));
        assert_eq!(Option::<u32>::decode(&None::<u32>.encode()), Ok(None));
    }

    #[test]
    fn test_bool_rejects_junk_tag() {
        let err = bool::decode(&[2]).unwrap_err();
        assert_eq!(err, CodecError::InvalidTag { offset: 0, tag: 2 });
    }

    #[test]
    fn test_eof_carries_offset() {
        let err = u64::decode(&[0, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedEof {
                offset: 0,
                needed: 5
            }
        );
    }

    #[test]
    fn test_length_overflow_rejected_before_alloc() {
        // Claims 4 GiB of payload with nothing behind it.
        let mut bytes = (u32::MAX).to_be_bytes().to_vec();
        bytes.push(0);
        let err = Vec::<u8>::decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::LengthOverflow { offset: 0, .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = 5u32.encode();
        bytes.push(0xff);
        let err = u32::decode(&bytes).unwrap_err();
        assert_eq!(
            err,
            CodecError::TrailingBytes {
                offset: 4,
                found: 1
            }
        );
    }

    #[test]
    fn test_seq_roundtrip() {
        let items = vec![1u64, 2, 3];
        let mut buf = Vec::new();
        encode_seq(&items, &mut buf);
        let mut r = Reader::new(&buf);
        assert_eq!(decode_seq::<u64>(&mut r), Ok(items));
        assert!(r.is_empty());
    }

    #[test]
    fn test_seq_count_overflow_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut r = Reader::new(&buf);
        assert!(matches!(
            decode_seq::<u64>(&mut r),
            Err(CodecError::LengthOverflow { offset: 0, .. })
        ));
    }

    #[test]
    fn test_encoding_is_canonical() {
        // Same value, independently constructed, same bytes.
        let a = (vec![9u8, 9, 9], Some(7u64)).encode();
        let b = (vec![9u8, 9, 9], Some(7u64)).encode();
        assert_eq!(a, b);
        // Different values, different bytes.
        assert_ne!(Some(0u64).encode(), None::<u64>.encode());
        assert_ne!(vec![0u8].encode(), Vec::<u8>::new().encode());
    }
}
