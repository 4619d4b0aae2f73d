//! Contract state and deduplicated contract code.

use crate::{Hash, TxOutputRef};
use lodestone_codec::{decode_seq, encode_seq, Codec, CodecError, CodecResult, Reader};
use std::fmt;

/// Identifier of a live contract. Keys the contract trie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractId(Hash);

impl ContractId {
    /// Wrap a raw contract id hash.
    pub fn new(hash: Hash) -> Self {
        Self(hash)
    }

    /// The underlying id hash.
    pub fn hash(&self) -> Hash {
        self.0
    }
}

impl Codec for ContractId {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.0.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self(Hash::decode_from(r)?))
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single mutable field of a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Boolean field.
    Bool(bool),

    /// Unsigned integer field.
    U64(u64),

    /// Raw byte field.
    Bytes(Vec<u8>),

    /// Hash-valued field (addresses, references).
    Hash(Hash),
}

const FIELD_BOOL_TAG: u8 = 0;
const FIELD_U64_TAG: u8 = 1;
const FIELD_BYTES_TAG: u8 = 2;
const FIELD_HASH_TAG: u8 = 3;

impl Codec for FieldValue {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            FieldValue::Bool(v) => {
                buf.push(FIELD_BOOL_TAG);
                v.encode_to(buf);
            }
            FieldValue::U64(v) => {
                buf.push(FIELD_U64_TAG);
                v.encode_to(buf);
            }
            FieldValue::Bytes(v) => {
                buf.push(FIELD_BYTES_TAG);
                v.encode_to(buf);
            }
            FieldValue::Hash(v) => {
                buf.push(FIELD_HASH_TAG);
                v.encode_to(buf);
            }
        }
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let at = r.offset();
        match r.read_byte()? {
            FIELD_BOOL_TAG => Ok(FieldValue::Bool(bool::decode_from(r)?)),
            FIELD_U64_TAG => Ok(FieldValue::U64(u64::decode_from(r)?)),
            FIELD_BYTES_TAG => Ok(FieldValue::Bytes(Vec::<u8>::decode_from(r)?)),
            FIELD_HASH_TAG => Ok(FieldValue::Hash(Hash::decode_from(r)?)),
            tag => Err(CodecError::InvalidTag { offset: at, tag }),
        }
    }
}

/// Mutable state of a live contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractState {
    /// Mutable fields, in declaration order.
    pub fields: Vec<FieldValue>,

    /// Reference of the contract's current output slot.
    pub output_ref: TxOutputRef,

    /// Content hash of the contract's code. Points into the code trie.
    pub code_hash: Hash,
}

impl Codec for ContractState {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        encode_seq(&self.fields, buf);
        self.output_ref.encode_to(buf);
        self.code_hash.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            fields: decode_seq(r)?,
            output_ref: TxOutputRef::decode_from(r)?,
            code_hash: Hash::decode_from(r)?,
        })
    }
}

/// Deduplicated contract code with a reference count.
///
/// Two contracts created from the same code share one record; the count
/// tracks how many contract states point at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRecord {
    /// The contract code bytes.
    pub code: Vec<u8>,

    /// Number of live contracts referencing this code.
    pub ref_count: u32,
}

impl CodeRecord {
    /// A fresh record for code referenced by its first contract.
    pub fn new(code: Vec<u8>) -> Self {
        Self { code, ref_count: 1 }
    }
}

impl Codec for CodeRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.code.encode_to(buf);
        self.ref_count.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            code: Vec::<u8>::decode_from(r)?,
            ref_count: u32::decode_from(r)?,
        })
    }
}
