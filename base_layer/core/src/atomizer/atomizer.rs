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

use std::collections::{BTreeSet, HashMap, HashSet};

use cbdc_common_types::Hash;
use serde::{Deserialize, Serialize};

use crate::{
    atomizer::Block,
    transactions::CompactTransaction,
    watchtower::{TxError, TxErrorKind},
};

/// A shard notification for one transaction: which of the transaction's
/// inputs the shard attests were unspent, at which block height.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(super) struct PendingNotification {
    pub tx: CompactTransaction,
    pub attested_inputs: HashSet<u64>,
}

/// Orders attested transactions into blocks while enforcing the no-double-
/// spend invariant over a sliding window of recently spent outputs.
///
/// Shard attestations are only valid at the block height they were made, so
/// notifications are bucketed by height offset from the current tip. A
/// transaction completes when the union of attested input indexes across the
/// window covers every input; its inputs are then spent at offset zero and
/// it is queued for the next block cut.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Atomizer {
    best_height: u64,
    stxo_cache_depth: usize,
    complete_txs: Vec<CompactTransaction>,
    /// Pending notifications by height offset; index 0 is the current
    /// height, index `i` is `i` blocks in the past.
    txs: Vec<HashMap<Hash, PendingNotification>>,
    /// Spent UHS ids by height offset.
    spent: Vec<HashSet<Hash>>,
}

impl Atomizer {
    pub fn new(best_height: u64, stxo_cache_depth: usize) -> Self {
        Self {
            best_height,
            stxo_cache_depth,
            complete_txs: Vec::new(),
            txs: vec![HashMap::new(); stxo_cache_depth + 1],
            spent: vec![HashSet::new(); stxo_cache_depth + 1],
        }
    }

    pub fn height(&self) -> u64 {
        self.best_height
    }

    pub fn stxo_cache_depth(&self) -> usize {
        self.stxo_cache_depth
    }

    /// Number of complete transactions awaiting the next block cut.
    pub fn pending_transactions(&self) -> usize {
        self.complete_txs.len()
    }

    /// Record a shard's attestation of `attested_inputs` for `tx` made at
    /// `block_height`. If the union of attestations now covers every input,
    /// the transaction is checked against the spent window and queued for
    /// the next block.
    pub fn insert(
        &mut self,
        block_height: u64,
        tx: CompactTransaction,
        attested_inputs: HashSet<u64>,
    ) -> Result<(), TxError> {
        let offset = self.notification_offset(block_height, &tx)?;

        let tx_id = tx.tx_id;
        let tx_inputs = tx.inputs.clone();
        match self.txs[offset].entry(tx_id) {
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(PendingNotification { tx, attested_inputs });
            },
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let pending = occupied.get_mut();
                pending.attested_inputs.extend(attested_inputs);
                pending.tx.merge_attestations(&tx.attestations);
            },
        }

        // Accumulate the attested input indexes for this transaction across
        // every offset in the window, tracking the oldest offset used.
        let mut total_attested: HashSet<u64> = HashSet::new();
        let mut oldest = 0;
        let mut found_offsets = Vec::new();
        for off in 0..=self.stxo_cache_depth {
            if let Some(pending) = self.txs[off].get(&tx_id) {
                total_attested.extend(pending.attested_inputs.iter().copied());
                oldest = off;
                found_offsets.push(off);
            }
        }

        if total_attested.len() != tx_inputs.len() {
            return Ok(());
        }

        // Attestations cover every input. Reject outright if any input was
        // spent at an offset the attestations span; the erased notifications
        // must not complete later.
        if let Some(err) = self.check_stxo_cache(tx_id, &tx_inputs, oldest) {
            for off in found_offsets {
                self.txs[off].remove(&tx_id);
            }
            return Err(err);
        }

        // Merge sentinel attestations from every copy, spend the inputs at
        // the current height and queue the transaction for the next cut.
        let mut complete: Option<CompactTransaction> = None;
        for off in found_offsets.into_iter().rev() {
            if let Some(pending) = self.txs[off].remove(&tx_id) {
                match complete.as_mut() {
                    None => complete = Some(pending.tx),
                    Some(merged) => merged.merge_attestations(&pending.tx.attestations),
                }
            }
        }
        if let Some(complete) = complete {
            self.spend_inputs(&complete);
            self.complete_txs.push(complete);
        }

        Ok(())
    }

    /// Queue a transaction whose sentinel attestation quorum makes shard
    /// attestations unnecessary. `oldest_attestation_height` bounds how far
    /// back the spent window must be checked.
    pub fn insert_complete(&mut self, oldest_attestation_height: u64, tx: CompactTransaction) -> Result<(), TxError> {
        let offset = self.notification_offset(oldest_attestation_height, &tx)?;

        if let Some(err) = self.check_stxo_cache(tx.tx_id, &tx.inputs, offset) {
            return Err(err);
        }

        self.spend_inputs(&tx);
        self.complete_txs.push(tx);
        Ok(())
    }

    /// Cut a block: drain the complete transactions into a block at the next
    /// height, expire notifications that fell off the window, and rotate the
    /// spent rings.
    pub fn make_block(&mut self) -> (Block, Vec<TxError>) {
        let transactions = std::mem::take(&mut self.complete_txs);
        self.best_height += 1;

        let expirations = self.txs[self.stxo_cache_depth]
            .values()
            .map(|pending| TxError::new(pending.tx.tx_id, TxErrorKind::Incomplete))
            .collect();

        for i in (1..=self.stxo_cache_depth).rev() {
            self.spent[i] = std::mem::take(&mut self.spent[i - 1]);
            self.txs[i] = std::mem::take(&mut self.txs[i - 1]);
        }
        self.spent[0].clear();
        self.txs[0].clear();

        (Block::new(self.best_height, transactions), expirations)
    }

    fn notification_offset(&self, block_height: u64, tx: &CompactTransaction) -> Result<usize, TxError> {
        let offset = match self.best_height.checked_sub(block_height) {
            Some(offset) => offset as usize,
            None => {
                // A notification from the future can only be valid for a
                // transaction with no inputs to attest.
                if tx.inputs.is_empty() {
                    return Ok(0);
                }
                return Err(TxError::new(tx.tx_id, TxErrorKind::StxoRange));
            },
        };
        if offset > self.stxo_cache_depth && !tx.inputs.is_empty() {
            return Err(TxError::new(tx.tx_id, TxErrorKind::StxoRange));
        }
        Ok(offset.min(self.stxo_cache_depth))
    }

    /// Check a transaction's inputs against the spent sets for offsets
    /// `[0, range]`.
    fn check_stxo_cache(&self, tx_id: Hash, inputs: &[Hash], range: usize) -> Option<TxError> {
        let mut offenders = BTreeSet::new();
        for offset in 0..=range {
            for input in inputs {
                if self.spent[offset].contains(input) {
                    offenders.insert(*input);
                }
            }
        }
        if offenders.is_empty() {
            None
        } else {
            Some(TxError::new(tx_id, TxErrorKind::InputsSpent { inputs: offenders }))
        }
    }

    fn spend_inputs(&mut self, tx: &CompactTransaction) {
        self.spent[0].extend(tx.inputs.iter().copied());
    }
}
