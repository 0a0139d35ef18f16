//  Copyright 2024. The CBDC Development Community
//
//  Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
//  following conditions are met:
//
//  1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
//  disclaimer.
//
//  2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
//  following disclaimer in the documentation and/or other materials provided with the distribution.
//
//  3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
//  products derived from this software without specific prior written permission.
//
//  THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
//  INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
//  DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
//  SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
//  SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
//  WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
//  USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    time::{Duration, SystemTime},
};

use cbdc_common_types::{sign_hash, Hash, PublicKey, SecretKey};
use cbdc_core::transactions::{
    input_from_output,
    witness_commitment,
    FullTransaction,
    Input,
    OutPoint,
    Output,
    P2PK_WITNESS_TYPE,
};
use secp256k1::{All, Secp256k1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: u64, available: u64 },
    #[error("No key material for output commitment {0}")]
    UnknownKey(Hash),
    #[error("Failed to read wallet file {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("Failed to write wallet file {path}: {reason}")]
    Store { path: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingTx {
    tx: FullTransaction,
    created_at: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingInput {
    input: Input,
    created_at: SystemTime,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WalletState {
    /// Spending keys by the witness program commitment of their outputs.
    keys: HashMap<Hash, SecretKey>,
    addresses: Vec<PublicKey>,
    /// Spendable outputs.
    utxos: BTreeMap<OutPoint, Output>,
    /// Outputs reserved under a pending transaction; unavailable for
    /// selection until confirmed or abandoned.
    reserved: BTreeMap<OutPoint, Output>,
    pending_txs: HashMap<Hash, PendingTx>,
    /// Inputs imported from senders, awaiting settlement confirmation.
    pending_inputs: BTreeMap<OutPoint, PendingInput>,
}

/// Local wallet: key material, unspent outputs and in-flight transactions.
/// Guarded by its owner; never shared across processes.
pub struct Wallet {
    secp: Secp256k1<All>,
    state: WalletState,
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

impl Wallet {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            state: WalletState::default(),
        }
    }

    /// Load a wallet from disk, or create an empty one if the file does not
    /// exist yet.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path).map_err(|e| WalletError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let state = bincode::deserialize(&bytes).map_err(|e| WalletError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            secp: Secp256k1::new(),
            state,
        })
    }

    /// Persist the wallet to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), WalletError> {
        let path = path.as_ref();
        let store_err = |reason: String| WalletError::Store {
            path: path.display().to_string(),
            reason,
        };
        let bytes = bincode::serialize(&self.state).map_err(|e| store_err(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| store_err(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| store_err(e.to_string()))?;
        Ok(())
    }

    /// Generate a fresh address other clients can pay to.
    pub fn new_address(&mut self) -> PublicKey {
        let (secret, public) = cbdc_common_types::new_keypair(&self.secp, &mut rand::thread_rng());
        self.state.keys.insert(witness_commitment(&public), secret);
        self.state.addresses.push(public);
        public
    }

    /// Spendable balance, excluding outputs reserved under pending
    /// transactions.
    pub fn balance(&self) -> u64 {
        self.state.utxos.values().map(|output| output.value).sum()
    }

    pub fn utxo_count(&self) -> usize {
        self.state.utxos.len()
    }

    pub fn pending_tx_count(&self) -> usize {
        self.state.pending_txs.len()
    }

    pub fn pending_input_count(&self) -> usize {
        self.state.pending_inputs.len()
    }

    /// Whether this wallet holds the spending key for an output.
    pub fn owns_output(&self, output: &Output) -> bool {
        self.state.keys.contains_key(&output.witness_program_commitment)
    }

    /// Build and sign a transaction paying `payments`, spending a minimal
    /// selection of this wallet's outputs and returning any change to a
    /// fresh address. The selected outputs are reserved until the
    /// transaction is confirmed or abandoned.
    pub fn create_transaction(&mut self, payments: &[(PublicKey, u64)]) -> Result<FullTransaction, WalletError> {
        let requested: u64 = payments.iter().map(|(_, value)| value).sum();
        let available = self.balance();
        if requested == 0 || requested > available {
            return Err(WalletError::InsufficientFunds { requested, available });
        }

        // Largest-first selection keeps the input set minimal.
        let mut candidates: Vec<(OutPoint, Output)> = self.state.utxos.iter().map(|(op, o)| (*op, *o)).collect();
        candidates.sort_by(|a, b| b.1.value.cmp(&a.1.value));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for (out_point, output) in candidates {
            selected.push((out_point, output));
            total += output.value;
            if total >= requested {
                break;
            }
        }

        let mut outputs: Vec<Output> = payments
            .iter()
            .map(|(payee, value)| Output::new(witness_commitment(payee), *value))
            .collect();
        if total > requested {
            let change_address = self.new_address();
            outputs.push(Output::new(witness_commitment(&change_address), total - requested));
        }

        let mut tx = FullTransaction {
            inputs: selected
                .iter()
                .map(|(out_point, output)| Input::new(*out_point, *output))
                .collect(),
            outputs,
            witnesses: vec![],
        };
        self.sign_transaction(&mut tx)?;

        // Reserve the consumed outputs under the pending transaction.
        for (out_point, output) in &selected {
            self.state.utxos.remove(out_point);
            self.state.reserved.insert(*out_point, *output);
        }
        self.state.pending_txs.insert(tx.tx_id(), PendingTx {
            tx: tx.clone(),
            created_at: SystemTime::now(),
        });

        Ok(tx)
    }

    /// Create `n_outputs` new outputs of `value` each to this wallet out of
    /// thin air. Statically invalid by design (no inputs); only a quorum of
    /// sentinel keys can make the settlement layer accept it.
    pub fn mint(&mut self, n_outputs: usize, value: u64) -> FullTransaction {
        let address = self.new_address();
        let commitment = witness_commitment(&address);
        let tx = FullTransaction {
            inputs: vec![],
            outputs: vec![Output::new(commitment, value); n_outputs],
            witnesses: vec![],
        };
        self.state.pending_txs.insert(tx.tx_id(), PendingTx {
            tx: tx.clone(),
            created_at: SystemTime::now(),
        });
        tx
    }

    /// Extract the outputs of a send transaction destined for `payee`,
    /// converted to inputs the recipient can import.
    pub fn export_send_inputs(tx: &FullTransaction, payee: &PublicKey) -> Vec<Input> {
        let commitment = witness_commitment(payee);
        (0..tx.outputs.len() as u64)
            .filter(|index| tx.outputs[*index as usize].witness_program_commitment == commitment)
            .filter_map(|index| input_from_output(tx, index))
            .collect()
    }

    /// Store an input received from a sender as a credit awaiting
    /// confirmation.
    pub fn import_send_input(&mut self, input: Input) {
        self.state.pending_inputs.insert(input.out_point, PendingInput {
            input,
            created_at: SystemTime::now(),
        });
    }

    /// Mark a transaction settled: consumed outputs are gone for good, and
    /// outputs destined to this wallet (from its own pending transactions or
    /// imported inputs) become spendable. Returns false if the id is
    /// unknown.
    pub fn confirm_transaction(&mut self, tx_id: &Hash) -> bool {
        let mut confirmed = false;

        if let Some(pending) = self.state.pending_txs.remove(tx_id) {
            for input in &pending.tx.inputs {
                self.state.reserved.remove(&input.out_point);
            }
            for index in 0..pending.tx.outputs.len() as u64 {
                let output = pending.tx.outputs[index as usize];
                if self.owns_output(&output) {
                    self.state.utxos.insert(OutPoint::new(*tx_id, index), output);
                }
            }
            confirmed = true;
        }

        let imported: Vec<OutPoint> = self
            .state
            .pending_inputs
            .iter()
            .filter(|(out_point, _)| out_point.tx_id == *tx_id)
            .map(|(out_point, _)| *out_point)
            .collect();
        for out_point in imported {
            if let Some(pending) = self.state.pending_inputs.remove(&out_point) {
                self.state.utxos.insert(out_point, pending.input.output);
                confirmed = true;
            }
        }

        confirmed
    }

    /// Un-reserve the outputs locked under a pending transaction. Returns
    /// false if the id is unknown.
    pub fn abandon_transaction(&mut self, tx_id: &Hash) -> bool {
        let Some(pending) = self.state.pending_txs.remove(tx_id) else {
            return false;
        };
        for input in &pending.tx.inputs {
            if let Some(output) = self.state.reserved.remove(&input.out_point) {
                self.state.utxos.insert(input.out_point, output);
            }
        }
        true
    }

    /// Pending transaction ids, oldest first.
    pub fn pending_tx_ids(&self) -> Vec<Hash> {
        let mut ids: Vec<(SystemTime, Hash)> = self
            .state
            .pending_txs
            .iter()
            .map(|(tx_id, pending)| (pending.created_at, *tx_id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, tx_id)| tx_id).collect()
    }

    /// Transaction ids of imported inputs awaiting confirmation.
    pub fn pending_input_tx_ids(&self) -> Vec<Hash> {
        self.state
            .pending_inputs
            .keys()
            .map(|out_point| out_point.tx_id)
            .collect()
    }

    /// (creating tx id, UHS id) for each imported input awaiting
    /// confirmation.
    pub fn pending_input_uhs_ids(&self) -> Vec<(Hash, Hash)> {
        self.state
            .pending_inputs
            .iter()
            .map(|(out_point, pending)| (out_point.tx_id, pending.input.uhs_id()))
            .collect()
    }

    /// The UHS ids to ask a status oracle about for a pending transaction:
    /// its consumed inputs and its outputs destined to this wallet.
    pub fn pending_tx_uhs_ids(&self, tx_id: &Hash) -> Vec<Hash> {
        let Some(pending) = self.state.pending_txs.get(tx_id) else {
            return Vec::new();
        };
        let mut uhs_ids: Vec<Hash> = pending.tx.inputs.iter().map(Input::uhs_id).collect();
        for index in 0..pending.tx.outputs.len() as u64 {
            if let Some(input) = input_from_output(&pending.tx, index) {
                uhs_ids.push(input.uhs_id());
            }
        }
        uhs_ids
    }

    /// Pending transactions older than `interval`.
    pub fn expired_pending_txs(&self, interval: Duration) -> Vec<Hash> {
        let now = SystemTime::now();
        self.state
            .pending_txs
            .iter()
            .filter(|(_, pending)| {
                now.duration_since(pending.created_at)
                    .map(|age| age > interval)
                    .unwrap_or(false)
            })
            .map(|(tx_id, _)| *tx_id)
            .collect()
    }

    fn sign_transaction(&self, tx: &mut FullTransaction) -> Result<(), WalletError> {
        let tx_id = tx.tx_id();
        let mut witnesses = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let commitment = input.output.witness_program_commitment;
            let secret = self
                .state
                .keys
                .get(&commitment)
                .ok_or(WalletError::UnknownKey(commitment))?;
            let public = cbdc_common_types::public_key_from_secret(&self.secp, secret);
            let signature = sign_hash(&self.secp, secret, &tx_id);
            let mut witness = Vec::with_capacity(1 + 32 + 64);
            witness.push(P2PK_WITNESS_TYPE);
            witness.extend_from_slice(&public.serialize());
            witness.extend_from_slice(&signature[..]);
            witnesses.push(witness);
        }
        tx.witnesses = witnesses;
        Ok(())
    }
}
