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

//! Atomizer-mode shard: holds the range-restricted unspent set, attests to
//! transaction inputs at its best observed block height, and applies blocks
//! in order.

use std::collections::{BTreeSet, HashSet};

use cbdc_common::ShardRange;
use cbdc_common_types::Hash;
use log::*;
use serde::{Deserialize, Serialize};

use crate::{
    atomizer::{Block, TxNotification},
    transactions::CompactTransaction,
    watchtower::{TxError, TxErrorKind},
};

const LOG_TARGET: &str = "c::shard";

/// Outcome of offering a block to the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockResult {
    /// The block extended the chain and was applied.
    Applied,
    /// The block height was at or below the best height; nothing changed.
    Stale,
    /// Blocks `[start, end]` must be fetched from the archiver and applied
    /// first.
    MissingRange { start: u64, end: u64 },
}

/// Range-partitioned UTXO store for the atomizer architecture.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shard {
    range: ShardRange,
    utxo: HashSet<Hash>,
    best_height: u64,
    /// Set while back-filling missed blocks; attestations made against a
    /// stale unspent set would be unsound.
    syncing: bool,
}

impl Shard {
    pub fn new(range: ShardRange) -> Self {
        Self {
            range,
            utxo: HashSet::new(),
            best_height: 0,
            syncing: false,
        }
    }

    pub fn set_syncing(&mut self, syncing: bool) {
        self.syncing = syncing;
    }

    pub fn range(&self) -> ShardRange {
        self.range
    }

    pub fn best_height(&self) -> u64 {
        self.best_height
    }

    /// Number of unspent ids held; paired with the best height for audits.
    pub fn audit(&self) -> (u64, usize) {
        (self.best_height, self.utxo.len())
    }

    /// Seed the unspent set directly, bypassing settlement. Used to
    /// establish genesis outputs.
    pub fn seed(&mut self, uhs_ids: impl IntoIterator<Item = Hash>) {
        for uhs_id in uhs_ids {
            if self.range.contains(&uhs_id) {
                self.utxo.insert(uhs_id);
            }
        }
    }

    /// Whether a UHS id is unspent on this shard. Only meaningful for ids in
    /// this shard's range.
    pub fn is_unspent(&self, uhs_id: &Hash) -> bool {
        self.utxo.contains(uhs_id)
    }

    /// Verify the in-range inputs of a compact transaction against the
    /// unspent set and produce an attestation for the atomizer. Transactions
    /// with no in-range inputs yield `Ok(None)`.
    pub fn digest_transaction(&self, tx: &CompactTransaction) -> Result<Option<TxNotification>, TxError> {
        if self.syncing {
            return Err(TxError::new(tx.tx_id, TxErrorKind::Sync));
        }
        let mut attested_inputs = BTreeSet::new();
        let mut missing = BTreeSet::new();
        for (index, input) in tx.inputs.iter().enumerate() {
            if !self.range.contains(input) {
                continue;
            }
            if self.utxo.contains(input) {
                attested_inputs.insert(index as u64);
            } else {
                missing.insert(*input);
            }
        }

        if !missing.is_empty() {
            return Err(TxError::new(tx.tx_id, TxErrorKind::InputsDne { inputs: missing }));
        }
        if attested_inputs.is_empty() {
            return Ok(None);
        }
        Ok(Some(TxNotification {
            block_height: self.best_height,
            tx: tx.clone(),
            attested_inputs,
        }))
    }

    /// Apply a block if it directly extends the chain. Non-contiguous blocks
    /// report the range that must be back-filled from the archiver first.
    pub fn digest_block(&mut self, block: &Block) -> BlockResult {
        if block.height <= self.best_height {
            return BlockResult::Stale;
        }
        if block.height != self.best_height + 1 {
            return BlockResult::MissingRange {
                start: self.best_height + 1,
                end: block.height - 1,
            };
        }

        for tx in &block.transactions {
            for input in &tx.inputs {
                if self.range.contains(input) {
                    self.utxo.remove(input);
                }
            }
            for output in &tx.outputs {
                if self.range.contains(output) {
                    self.utxo.insert(*output);
                }
            }
        }
        self.best_height = block.height;
        debug!(
            target: LOG_TARGET,
            "Applied block {}; unspent set size {}",
            block.height,
            self.utxo.len()
        );
        BlockResult::Applied
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn full_range() -> ShardRange {
        ShardRange::new(0, 255)
    }

    fn ctx(name: &[u8], inputs: Vec<Hash>, outputs: Vec<Hash>) -> CompactTransaction {
        CompactTransaction {
            tx_id: Hash::digest(name),
            inputs,
            outputs,
            attestations: Default::default(),
        }
    }

    fn hash_with_leading_byte(byte: u8) -> Hash {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        bytes[1] = byte.wrapping_add(1);
        Hash::from_bytes(bytes)
    }

    #[test]
    fn attests_to_known_inputs_at_best_height() {
        let mut shard = Shard::new(full_range());
        let coin = Hash::digest(b"coin");
        shard.seed([coin]);

        let tx = ctx(b"tx", vec![coin], vec![Hash::digest(b"out")]);
        let notification = shard.digest_transaction(&tx).unwrap().unwrap();
        assert_eq!(notification.block_height, 0);
        assert_eq!(notification.attested_inputs, [0].into_iter().collect());
    }

    #[test]
    fn reports_missing_inputs() {
        let shard = Shard::new(full_range());
        let tx = ctx(b"tx", vec![Hash::digest(b"ghost")], vec![]);
        let err = shard.digest_transaction(&tx).unwrap_err();
        match err.kind {
            TxErrorKind::InputsDne { inputs } => {
                assert_eq!(inputs, [Hash::digest(b"ghost")].into_iter().collect());
            },
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[test]
    fn ignores_out_of_range_inputs() {
        let shard = Shard::new(ShardRange::new(0, 10));
        let out_of_range = hash_with_leading_byte(200);
        let tx = ctx(b"tx", vec![out_of_range], vec![]);
        // Not an error and nothing to attest: the input is not ours.
        assert_eq!(shard.digest_transaction(&tx).unwrap(), None);
    }

    #[test]
    fn applies_contiguous_blocks() {
        let mut shard = Shard::new(full_range());
        let coin = Hash::digest(b"coin");
        shard.seed([coin]);

        let created = Hash::digest(b"created");
        let block = Block::new(1, vec![ctx(b"tx", vec![coin], vec![created])]);
        assert_eq!(shard.digest_block(&block), BlockResult::Applied);
        assert!(!shard.is_unspent(&coin));
        assert!(shard.is_unspent(&created));
        assert_eq!(shard.best_height(), 1);
    }

    #[test]
    fn rejects_gap_with_missing_range() {
        let mut shard = Shard::new(full_range());
        let block = Block::new(4, vec![]);
        assert_eq!(shard.digest_block(&block), BlockResult::MissingRange { start: 1, end: 3 });
        assert_eq!(shard.best_height(), 0);
    }

    #[test]
    fn syncing_shard_refuses_to_attest() {
        let mut shard = Shard::new(full_range());
        let coin = Hash::digest(b"coin");
        shard.seed([coin]);
        shard.set_syncing(true);

        let tx = ctx(b"tx", vec![coin], vec![]);
        let err = shard.digest_transaction(&tx).unwrap_err();
        assert_eq!(err.kind, TxErrorKind::Sync);

        shard.set_syncing(false);
        shard.digest_transaction(&tx).unwrap();
    }

    #[test]
    fn stale_blocks_are_idempotent() {
        let mut shard = Shard::new(full_range());
        let block = Block::new(1, vec![]);
        assert_eq!(shard.digest_block(&block), BlockResult::Applied);
        assert_eq!(shard.digest_block(&block), BlockResult::Stale);
    }

    #[test]
    fn only_in_range_outputs_are_stored() {
        let mut shard = Shard::new(ShardRange::new(0, 10));
        let in_range = hash_with_leading_byte(5);
        let out_of_range = hash_with_leading_byte(100);
        let block = Block::new(1, vec![ctx(b"tx", vec![], vec![in_range, out_of_range])]);
        shard.digest_block(&block);
        assert!(shard.is_unspent(&in_range));
        assert!(!shard.is_unspent(&out_of_range));
        assert_eq!(shard.audit(), (1, 1));
    }
}
