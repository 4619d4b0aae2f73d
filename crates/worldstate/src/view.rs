//! Shared capability traits of the world-state variants.
//!
//! The persisted, cached and staging variants share one read surface and
//! the two mutating variants share one write surface. The write trait's
//! low-level tree accessors are what differ per variant; every domain
//! rule (asset typing, contract lifecycle, code refcounting) lives in the
//! provided methods so it cannot drift between variants.

use lodestone_storage::{StoreError, StoreResult};
use lodestone_types::{
    AssetOutput, CodeRecord, ContractId, ContractOutput, ContractState, FieldValue, Hash, TxOutput,
    TxOutputRef,
};

/// Read capability shared by all world-state variants.
pub trait WorldStateView {
    /// Output by reference, `None` when absent.
    fn get_output_opt(&self, output_ref: &TxOutputRef) -> StoreResult<Option<TxOutput>>;

    /// Contract state by id, `None` when absent.
    fn get_contract_opt(&self, id: &ContractId) -> StoreResult<Option<ContractState>>;

    /// Code record by code hash, `None` when absent.
    fn get_code_opt(&self, code_hash: &Hash) -> StoreResult<Option<CodeRecord>>;

    /// Output by reference, failing when absent.
    fn get_output(&self, output_ref: &TxOutputRef) -> StoreResult<TxOutput> {
        self.get_output_opt(output_ref)?
            .ok_or_else(|| StoreError::KeyNotFound(output_ref.hash().to_hex()))
    }

    /// Asset output by reference.
    ///
    /// Fails with [`StoreError::InvariantViolation`] when the reference
    /// resolves to a contract output: spending a contract slot as a plain
    /// asset is a schema-level mismatch, not a missing key.
    fn get_asset(&self, output_ref: &TxOutputRef) -> StoreResult<AssetOutput> {
        match self.get_output(output_ref)? {
            TxOutput::Asset(output) => Ok(output),
            TxOutput::Contract(_) => Err(StoreError::InvariantViolation(format!(
                "expected asset output at {output_ref}, found contract output"
            ))),
        }
    }

    /// Contract state by id, failing when absent.
    fn get_contract(&self, id: &ContractId) -> StoreResult<ContractState> {
        self.get_contract_opt(id)?
            .ok_or_else(|| StoreError::KeyNotFound(id.hash().to_hex()))
    }

    /// Code record by code hash, failing when absent.
    fn get_code(&self, code_hash: &Hash) -> StoreResult<CodeRecord> {
        self.get_code_opt(code_hash)?
            .ok_or_else(|| StoreError::KeyNotFound(code_hash.to_hex()))
    }

    /// Output presence.
    fn output_exists(&self, output_ref: &TxOutputRef) -> StoreResult<bool> {
        Ok(self.get_output_opt(output_ref)?.is_some())
    }

    /// Contract presence.
    fn contract_exists(&self, id: &ContractId) -> StoreResult<bool> {
        Ok(self.get_contract_opt(id)?.is_some())
    }
}

/// In-place write capability of the cached and staging variants.
///
/// The persisted variant exposes the same domain operations in
/// `self -> Result<Self>` form instead; see `WorldState`.
pub trait WorldStateMut: WorldStateView {
    /// Insert or overwrite an output.
    fn put_output(&mut self, output_ref: TxOutputRef, output: TxOutput) -> StoreResult<()>;

    /// Remove an output; `KeyNotFound` when absent.
    fn remove_output(&mut self, output_ref: &TxOutputRef) -> StoreResult<()>;

    /// Insert or overwrite a contract state.
    fn put_contract(&mut self, id: ContractId, state: ContractState) -> StoreResult<()>;

    /// Remove a contract state; `KeyNotFound` when absent.
    fn remove_contract_state(&mut self, id: &ContractId) -> StoreResult<()>;

    /// Insert or overwrite a code record.
    fn put_code(&mut self, code_hash: Hash, record: CodeRecord) -> StoreResult<()>;

    /// Remove a code record; `KeyNotFound` when absent.
    fn remove_code(&mut self, code_hash: &Hash) -> StoreResult<()>;

    /// Add an asset output. Overwriting an existing reference is allowed;
    /// reference uniqueness is the caller's contract.
    fn add_asset(&mut self, output_ref: TxOutputRef, output: AssetOutput) -> StoreResult<()> {
        self.put_output(output_ref, TxOutput::Asset(output))
    }

    /// Remove an asset output; `KeyNotFound` when absent.
    fn remove_asset(&mut self, output_ref: &TxOutputRef) -> StoreResult<()> {
        self.remove_output(output_ref)
    }

    /// Create a contract, failing when `id` already exists.
    fn create_contract(
        &mut self,
        id: ContractId,
        code: Vec<u8>,
        fields: Vec<FieldValue>,
        output_ref: TxOutputRef,
        output: ContractOutput,
    ) -> StoreResult<()> {
        if self.contract_exists(&id)? {
            return Err(StoreError::InvariantViolation(format!(
                "contract {id} already exists"
            )));
        }
        self.create_contract_unchecked(id, code, fields, output_ref, output)
    }

    /// Create a contract without checking for an existing `id`.
    ///
    /// Precondition: no contract state exists under `id`. Intended for
    /// callers that have already validated this (the VM derives fresh ids
    /// and checks them during transaction validation); violating it
    /// silently overwrites the existing state and corrupts the code
    /// refcount. Writes all three trees: the contract output, the
    /// contract state, and the code record (created with count 1 or
    /// re-referenced with its count bumped).
    fn create_contract_unchecked(
        &mut self,
        id: ContractId,
        code: Vec<u8>,
        fields: Vec<FieldValue>,
        output_ref: TxOutputRef,
        output: ContractOutput,
    ) -> StoreResult<()> {
        let code_hash = Hash::from_bytes(&code);
        let record = match self.get_code_opt(&code_hash)? {
            Some(existing) => CodeRecord {
                code: existing.code,
                ref_count: existing.ref_count + 1,
            },
            None => CodeRecord::new(code),
        };
        self.put_code(code_hash, record)?;
        self.put_contract(
            id,
            ContractState {
                fields,
                output_ref,
                code_hash,
            },
        )?;
        self.put_output(output_ref, TxOutput::Contract(output))
    }

    /// Rewrite a contract's mutable fields, keeping output and code.
    fn update_contract_fields(
        &mut self,
        id: &ContractId,
        fields: Vec<FieldValue>,
    ) -> StoreResult<()> {
        let mut state = self.get_contract(id)?;
        state.fields = fields;
        self.put_contract(*id, state)
    }

    /// Rewrite a contract's output slot, keeping its fields.
    ///
    /// The previous output is not removed here: it is spent by the
    /// transaction that carries the update, through `remove_output`.
    fn update_contract_output(
        &mut self,
        id: &ContractId,
        output_ref: TxOutputRef,
        output: ContractOutput,
    ) -> StoreResult<()> {
        let mut state = self.get_contract(id)?;
        state.output_ref = output_ref;
        self.put_contract(*id, state)?;
        self.put_output(output_ref, TxOutput::Contract(output))
    }

    /// Remove a contract: its state, its output slot, and one reference
    /// to its code. The code record is deleted when the count reaches
    /// zero; a count already at zero is an [`StoreError::InvariantViolation`]
    /// (it means a double-remove slipped past the caller).
    fn remove_contract(&mut self, id: &ContractId) -> StoreResult<()> {
        let state = self.get_contract(id)?;
        self.remove_output(&state.output_ref)?;
        self.remove_contract_state(id)?;

        let record = self.get_code(&state.code_hash)?;
        match record.ref_count {
            0 => Err(StoreError::InvariantViolation(format!(
                "code refcount underflow for {}",
                state.code_hash
            ))),
            1 => self.remove_code(&state.code_hash),
            n => self.put_code(
                state.code_hash,
                CodeRecord {
                    code: record.code,
                    ref_count: n - 1,
                },
            ),
        }
    }
}
