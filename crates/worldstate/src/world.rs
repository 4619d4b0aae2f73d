//! The three-tree world-state façade.

use crate::cached::CachedTrie;
use crate::staging::StagingTrie;
use crate::view::{WorldStateMut, WorldStateView};
use lodestone_codec::{Codec, CodecResult, Reader};
use lodestone_storage::{RawKvStore, StoreError, StoreResult};
use lodestone_trie::SparseMerkleTrie;
use lodestone_types::{
    AssetOutput, CodeRecord, ContractId, ContractOutput, ContractState, FieldValue, Hash, TxOutput,
    TxOutputRef,
};
use std::sync::Arc;

/// The three trie roots a block header commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldStateRoots {
    /// Root of the output trie.
    pub output_root: Hash,

    /// Root of the contract trie.
    pub contract_root: Hash,

    /// Root of the code trie.
    pub code_root: Hash,
}

impl Codec for WorldStateRoots {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.output_root.encode_to(buf);
        self.contract_root.encode_to(buf);
        self.code_root.encode_to(buf);
    }

    fn decode_from(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            output_root: Hash::decode_from(r)?,
            contract_root: Hash::decode_from(r)?,
            code_root: Hash::decode_from(r)?,
        })
    }
}

/// Persisted world state: three authenticated trees over one node store.
///
/// An immutable value. Domain operations return a *new* world state whose
/// roots reflect the change; the old value keeps reading the old state.
/// Shared read access from other tasks is therefore safe without locks.
///
/// Block validation does not mutate this directly — it works on a
/// [`CachedWorldState`] (one per block) and [`StagingWorldState`] views
/// (one per transaction), then folds everything back into a new persisted
/// value via [`CachedWorldState::persist`].
pub struct WorldState<S> {
    outputs: SparseMerkleTrie<TxOutputRef, TxOutput, S>,
    contracts: SparseMerkleTrie<ContractId, ContractState, S>,
    code: SparseMerkleTrie<Hash, CodeRecord, S>,
}

impl<S> Clone for WorldState<S> {
    fn clone(&self) -> Self {
        Self {
            outputs: self.outputs.clone(),
            contracts: self.contracts.clone(),
            code: self.code.clone(),
        }
    }
}

impl<S: RawKvStore> WorldState<S> {
    /// The empty world state over `store`.
    pub fn empty(store: Arc<S>) -> Self {
        Self {
            outputs: SparseMerkleTrie::empty(Arc::clone(&store)),
            contracts: SparseMerkleTrie::empty(Arc::clone(&store)),
            code: SparseMerkleTrie::empty(store),
        }
    }

    /// Rehydrate from the roots recorded in a block header.
    pub fn open(store: Arc<S>, roots: WorldStateRoots) -> Self {
        Self {
            outputs: SparseMerkleTrie::open(Arc::clone(&store), roots.output_root),
            contracts: SparseMerkleTrie::open(Arc::clone(&store), roots.contract_root),
            code: SparseMerkleTrie::open(store, roots.code_root),
        }
    }

    /// Bootstrap a genesis world state from initial asset allocations.
    pub fn genesis(
        store: Arc<S>,
        allocations: impl IntoIterator<Item = (TxOutputRef, AssetOutput)>,
    ) -> StoreResult<Self> {
        let mut cached = Self::empty(store).cached();
        for (output_ref, output) in allocations {
            cached.add_asset(output_ref, output)?;
        }
        cached.persist()
    }

    /// The roots committed into the block header.
    pub fn roots(&self) -> WorldStateRoots {
        WorldStateRoots {
            output_root: self.outputs.root_hash(),
            contract_root: self.contracts.root_hash(),
            code_root: self.code.root_hash(),
        }
    }

    /// The composite block-state hash: `H(output_root ‖ contract_root)`.
    ///
    /// The code root is deliberately left out — code is deduplicated
    /// content already authenticated by the `code_hash` inside each
    /// contract state.
    pub fn block_state_hash(&self) -> Hash {
        Hash::from_parts(&[
            self.outputs.root_hash().as_bytes(),
            self.contracts.root_hash().as_bytes(),
        ])
    }

    /// Open a buffered view for block validation.
    pub fn cached(&self) -> CachedWorldState<S> {
        CachedWorldState {
            outputs: CachedTrie::new(self.outputs.clone()),
            contracts: CachedTrie::new(self.contracts.clone()),
            code: CachedTrie::new(self.code.clone()),
        }
    }

    /// Asset outputs whose reference digest starts with `prefix`, capped
    /// at `max`, in digest order.
    pub fn scan_asset_outputs(
        &self,
        prefix: &[u8],
        max: usize,
    ) -> StoreResult<Vec<(TxOutputRef, AssetOutput)>> {
        let hits = self.outputs.scan(prefix, max, |_, out| out.is_asset())?;
        Ok(collect_assets(hits))
    }

    /// Add an asset output.
    pub fn add_asset(&self, output_ref: TxOutputRef, output: AssetOutput) -> StoreResult<Self> {
        Ok(Self {
            outputs: self.outputs.put(&output_ref, &TxOutput::Asset(output))?,
            contracts: self.contracts.clone(),
            code: self.code.clone(),
        })
    }

    /// Remove an asset output; `KeyNotFound` when absent.
    pub fn remove_asset(&self, output_ref: &TxOutputRef) -> StoreResult<Self> {
        Ok(Self {
            outputs: self.outputs.remove(output_ref)?,
            contracts: self.contracts.clone(),
            code: self.code.clone(),
        })
    }

    /// Create a contract, failing when `id` already exists.
    pub fn create_contract(
        &self,
        id: ContractId,
        code: Vec<u8>,
        fields: Vec<FieldValue>,
        output_ref: TxOutputRef,
        output: ContractOutput,
    ) -> StoreResult<Self> {
        if self.contracts.exists(&id)? {
            return Err(StoreError::InvariantViolation(format!(
                "contract {id} already exists"
            )));
        }
        self.create_contract_unchecked(id, code, fields, output_ref, output)
    }

    /// Create a contract without checking for an existing `id`.
    ///
    /// Precondition: no contract state exists under `id`; see
    /// [`WorldStateMut::create_contract_unchecked`].
    pub fn create_contract_unchecked(
        &self,
        id: ContractId,
        code: Vec<u8>,
        fields: Vec<FieldValue>,
        output_ref: TxOutputRef,
        output: ContractOutput,
    ) -> StoreResult<Self> {
        let code_hash = Hash::from_bytes(&code);
        let record = match self.code.get_opt(&code_hash)? {
            Some(existing) => CodeRecord {
                code: existing.code,
                ref_count: existing.ref_count + 1,
            },
            None => CodeRecord::new(code),
        };
        Ok(Self {
            outputs: self.outputs.put(&output_ref, &TxOutput::Contract(output))?,
            contracts: self.contracts.put(
                &id,
                &ContractState {
                    fields,
                    output_ref,
                    code_hash,
                },
            )?,
            code: self.code.put(&code_hash, &record)?,
        })
    }

    /// Rewrite a contract's mutable fields.
    pub fn update_contract_fields(
        &self,
        id: &ContractId,
        fields: Vec<FieldValue>,
    ) -> StoreResult<Self> {
        let mut state = self.get_contract(id)?;
        state.fields = fields;
        Ok(Self {
            outputs: self.outputs.clone(),
            contracts: self.contracts.put(id, &state)?,
            code: self.code.clone(),
        })
    }

    /// Rewrite a contract's output slot, keeping its fields.
    pub fn update_contract_output(
        &self,
        id: &ContractId,
        output_ref: TxOutputRef,
        output: ContractOutput,
    ) -> StoreResult<Self> {
        let mut state = self.get_contract(id)?;
        state.output_ref = output_ref;
        Ok(Self {
            outputs: self.outputs.put(&output_ref, &TxOutput::Contract(output))?,
            contracts: self.contracts.put(id, &state)?,
            code: self.code.clone(),
        })
    }

    /// Remove a contract, its output, and one reference to its code.
    pub fn remove_contract(&self, id: &ContractId) -> StoreResult<Self> {
        let state = self.get_contract(id)?;
        let record = self.get_code(&state.code_hash)?;
        let code = match record.ref_count {
            0 => {
                return Err(StoreError::InvariantViolation(format!(
                    "code refcount underflow for {}",
                    state.code_hash
                )))
            }
            1 => self.code.remove(&state.code_hash)?,
            n => self.code.put(
                &state.code_hash,
                &CodeRecord {
                    code: record.code,
                    ref_count: n - 1,
                },
            )?,
        };
        Ok(Self {
            outputs: self.outputs.remove(&state.output_ref)?,
            contracts: self.contracts.remove(id)?,
            code,
        })
    }
}

impl<S: RawKvStore> WorldStateView for WorldState<S> {
    fn get_output_opt(&self, output_ref: &TxOutputRef) -> StoreResult<Option<TxOutput>> {
        self.outputs.get_opt(output_ref)
    }

    fn get_contract_opt(&self, id: &ContractId) -> StoreResult<Option<ContractState>> {
        self.contracts.get_opt(id)
    }

    fn get_code_opt(&self, code_hash: &Hash) -> StoreResult<Option<CodeRecord>> {
        self.code.get_opt(code_hash)
    }
}

/// Buffered world state for block validation.
///
/// All mutations accumulate in per-tree pending maps;
/// [`persist`](Self::persist) folds them into the node store and yields
/// the new persisted value whose roots go into the block header.
pub struct CachedWorldState<S> {
    outputs: CachedTrie<TxOutputRef, TxOutput, S>,
    contracts: CachedTrie<ContractId, ContractState, S>,
    code: CachedTrie<Hash, CodeRecord, S>,
}

impl<S: RawKvStore> CachedWorldState<S> {
    /// Open a speculative per-transaction view.
    ///
    /// The staging view exclusively borrows this cache until it is
    /// committed or rolled back.
    pub fn staging(&mut self) -> StagingWorldState<'_, S> {
        StagingWorldState {
            outputs: StagingTrie::new(&mut self.outputs),
            contracts: StagingTrie::new(&mut self.contracts),
            code: StagingTrie::new(&mut self.code),
        }
    }

    /// Fold all buffered mutations into the node store.
    ///
    /// A failure leaves the previous persisted state fully intact: nodes
    /// written before the failure are unreferenced orphans.
    pub fn persist(self) -> StoreResult<WorldState<S>> {
        tracing::debug!(
            outputs = self.outputs.pending_len(),
            contracts = self.contracts.pending_len(),
            code = self.code.pending_len(),
            "persisting world state caches"
        );
        Ok(WorldState {
            outputs: self.outputs.persist()?,
            contracts: self.contracts.persist()?,
            code: self.code.persist()?,
        })
    }

    /// Asset outputs under a reference-digest prefix, as seen through the
    /// buffer (pending inserts included, pending removes excluded).
    pub fn scan_asset_outputs(
        &self,
        prefix: &[u8],
        max: usize,
    ) -> StoreResult<Vec<(TxOutputRef, AssetOutput)>> {
        let hits = self.outputs.scan(prefix, max, |_, out| out.is_asset())?;
        Ok(collect_assets(hits))
    }
}

impl<S: RawKvStore> WorldStateView for CachedWorldState<S> {
    fn get_output_opt(&self, output_ref: &TxOutputRef) -> StoreResult<Option<TxOutput>> {
        self.outputs.get_opt(output_ref)
    }

    fn get_contract_opt(&self, id: &ContractId) -> StoreResult<Option<ContractState>> {
        self.contracts.get_opt(id)
    }

    fn get_code_opt(&self, code_hash: &Hash) -> StoreResult<Option<CodeRecord>> {
        self.code.get_opt(code_hash)
    }
}

impl<S: RawKvStore> WorldStateMut for CachedWorldState<S> {
    fn put_output(&mut self, output_ref: TxOutputRef, output: TxOutput) -> StoreResult<()> {
        self.outputs.put(output_ref, output)
    }

    fn remove_output(&mut self, output_ref: &TxOutputRef) -> StoreResult<()> {
        self.outputs.remove(output_ref)
    }

    fn put_contract(&mut self, id: ContractId, state: ContractState) -> StoreResult<()> {
        self.contracts.put(id, state)
    }

    fn remove_contract_state(&mut self, id: &ContractId) -> StoreResult<()> {
        self.contracts.remove(id)
    }

    fn put_code(&mut self, code_hash: Hash, record: CodeRecord) -> StoreResult<()> {
        self.code.put(code_hash, record)
    }

    fn remove_code(&mut self, code_hash: &Hash) -> StoreResult<()> {
        self.code.remove(code_hash)
    }
}

/// Speculative per-transaction world state.
///
/// Mutations stay in the staging layer until [`commit`](Self::commit)
/// folds them into the enclosing cache or [`rollback`](Self::rollback)
/// discards them. Both close the view by consuming it.
pub struct StagingWorldState<'a, S> {
    outputs: StagingTrie<'a, TxOutputRef, TxOutput, S>,
    contracts: StagingTrie<'a, ContractId, ContractState, S>,
    code: StagingTrie<'a, Hash, CodeRecord, S>,
}

impl<S: RawKvStore> StagingWorldState<'_, S> {
    /// Fold the staged mutations into the enclosing cache.
    ///
    /// O(staged entries); the byte store is not touched.
    pub fn commit(self) {
        self.outputs.commit();
        self.contracts.commit();
        self.code.commit();
    }

    /// Discard the staged mutations.
    pub fn rollback(self) {
        self.outputs.rollback();
        self.contracts.rollback();
        self.code.rollback();
    }

    /// Asset outputs under a reference-digest prefix, as seen through
    /// both pending layers.
    pub fn scan_asset_outputs(
        &self,
        prefix: &[u8],
        max: usize,
    ) -> StoreResult<Vec<(TxOutputRef, AssetOutput)>> {
        let hits = self.outputs.scan(prefix, max, |_, out| out.is_asset())?;
        Ok(collect_assets(hits))
    }
}

impl<S: RawKvStore> WorldStateView for StagingWorldState<'_, S> {
    fn get_output_opt(&self, output_ref: &TxOutputRef) -> StoreResult<Option<TxOutput>> {
        self.outputs.get_opt(output_ref)
    }

    fn get_contract_opt(&self, id: &ContractId) -> StoreResult<Option<ContractState>> {
        self.contracts.get_opt(id)
    }

    fn get_code_opt(&self, code_hash: &Hash) -> StoreResult<Option<CodeRecord>> {
        self.code.get_opt(code_hash)
    }
}

impl<S: RawKvStore> WorldStateMut for StagingWorldState<'_, S> {
    fn put_output(&mut self, output_ref: TxOutputRef, output: TxOutput) -> StoreResult<()> {
        self.outputs.put(output_ref, output)
    }

    fn remove_output(&mut self, output_ref: &TxOutputRef) -> StoreResult<()> {
        self.outputs.remove(output_ref)
    }

    fn put_contract(&mut self, id: ContractId, state: ContractState) -> StoreResult<()> {
        self.contracts.put(id, state)
    }

    fn remove_contract_state(&mut self, id: &ContractId) -> StoreResult<()> {
        self.contracts.remove(id)
    }

    fn put_code(&mut self, code_hash: Hash, record: CodeRecord) -> StoreResult<()> {
        self.code.put(code_hash, record)
    }

    fn remove_code(&mut self, code_hash: &Hash) -> StoreResult<()> {
        self.code.remove(code_hash)
    }
}

fn collect_assets(hits: Vec<(TxOutputRef, TxOutput)>) -> Vec<(TxOutputRef, AssetOutput)> {
    hits.into_iter()
        .filter_map(|(r, out)| match out {
            TxOutput::Asset(asset) => Some((r, asset)),
            TxOutput::Contract(_) => None,
        })
        .collect()
}
