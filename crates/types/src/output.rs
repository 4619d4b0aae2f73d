//! Transaction outputs and their references.

use crate::{ContractId, Hash};
use lodestone_codec::{Codec, CodecError, CodecResult, Reader};
use std::fmt;

/// A 32-byte reference identifying a transaction output.
///
/// Keys the output trie. The reference is opaque here; the transaction
/// layer derives it from the producing transaction id and output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxOutputRef(Hash);

impl TxOutputRef {
    /// Wrap a raw reference hash.
    pub fn new(hash: Hash) -> Self {
        Self(hash)
    }

    /// The underlying reference hash.
    pub fn hash(&self) -> Hash {
        self.0
    }
}

impl Codec for TxOutputRef {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.0.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self(Hash::decode_from(r)?))
    }
}

impl fmt::Display for TxOutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An unspent output owned by a regular lock script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetOutput {
    /// Amount carried by the output, in base units.
    pub amount: u64,

    /// Hash of the lock script guarding the output.
    pub lock_hash: Hash,

    /// Opaque payload attached by the producing transaction.
    pub data: Vec<u8>,
}

impl Codec for AssetOutput {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.amount.encode_to(buf);
        self.lock_hash.encode_to(buf);
        self.data.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            amount: u64::decode_from(r)?,
            lock_hash: Hash::decode_from(r)?,
            data: Vec::<u8>::decode_from(r)?,
        })
    }
}

/// The output slot holding a live contract's balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractOutput {
    /// Amount held by the contract, in base units.
    pub amount: u64,

    /// The contract this output belongs to.
    pub contract_id: ContractId,
}

impl Codec for ContractOutput {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.amount.encode_to(buf);
        self.contract_id.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            amount: u64::decode_from(r)?,
            contract_id: ContractId::decode_from(r)?,
        })
    }
}

/// A transaction output: either a plain asset or a contract slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutput {
    /// Spendable output guarded by a lock script.
    Asset(AssetOutput),

    /// Output bound to a live contract.
    Contract(ContractOutput),
}

impl TxOutput {
    /// True for [`TxOutput::Asset`].
    pub fn is_asset(&self) -> bool {
        matches!(self, TxOutput::Asset(_))
    }

    /// True for [`TxOutput::Contract`].
    pub fn is_contract(&self) -> bool {
        matches!(self, TxOutput::Contract(_))
    }
}

const OUTPUT_ASSET_TAG: u8 = 0;
const OUTPUT_CONTRACT_TAG: u8 = 1;

impl Codec for TxOutput {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            TxOutput::Asset(out) => {
                buf.push(OUTPUT_ASSET_TAG);
                out.encode_to(buf);
            }
            TxOutput::Contract(out) => {
                buf.push(OUTPUT_CONTRACT_TAG);
                out.encode_to(buf);
            }
        }
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        let at = r.offset();
        match r.read_byte()? {
            OUTPUT_ASSET_TAG => Ok(TxOutput::Asset(AssetOutput::decode_from(r)?)),
            OUTPUT_CONTRACT_TAG => Ok(TxOutput::Contract(ContractOutput::decode_from(r)?)),
            tag => Err(CodecError::InvalidTag { offset: at, tag }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset() -> TxOutput {
        TxOutput::Asset(AssetOutput {
            amount: 1_000,
            lock_hash: Hash::from_bytes(b"lock"),
            data: vec![0xca, 0xfe],
        })
    }

    fn contract() -> TxOutput {
        TxOutput::Contract(ContractOutput {
            amount: 42,
            contract_id: ContractId::new(Hash::from_bytes(b"contract")),
        })
    }

    #[test]
    fn test_output_roundtrip() {
        for out in [asset(), contract()] {
            assert_eq!(TxOutput::decode(&out.encode()), Ok(out));
        }
    }

    #[test]
    fn test_output_variants_encode_differently() {
        assert_ne!(asset().encode(), contract().encode());
        assert!(asset().is_asset());
        assert!(contract().is_contract());
    }

    #[test]
    fn test_output_rejects_unknown_tag() {
        let mut bytes = asset().encode();
        bytes[0] = 9;
        assert!(matches!(
            TxOutput::decode(&bytes),
            Err(CodecError::InvalidTag { offset: 0, tag: 9 })
        ));
    }

    #[test]
    fn test_output_ref_roundtrip() {
        let r = TxOutputRef::new(Hash::from_bytes(b"ref"));
        assert_eq!(TxOutputRef::decode(&r.encode()), Ok(r));
    }
}
