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

use std::collections::{HashMap, VecDeque};

use cbdc_common_types::Hash;

use crate::atomizer::Block;

/// Bounded FIFO of recent blocks, indexed for status queries: which UHS ids
/// were spent or created, and which transactions confirmed, at which height.
pub struct BlockCache {
    /// Maximum blocks retained; zero means unbounded.
    capacity: usize,
    blocks: VecDeque<Block>,
    /// UHS id consumed by a block in the cache → (height, consuming tx id).
    spent: HashMap<Hash, (u64, Hash)>,
    /// UHS id created by a block in the cache → (height, creating tx id).
    unspent: HashMap<Hash, (u64, Hash)>,
    /// Confirmed tx id → height.
    confirmed: HashMap<Hash, u64>,
    best_height: u64,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            blocks: VecDeque::new(),
            spent: HashMap::new(),
            unspent: HashMap::new(),
            confirmed: HashMap::new(),
            best_height: 0,
        }
    }

    pub fn best_height(&self) -> u64 {
        self.best_height
    }

    pub fn add_block(&mut self, block: Block) {
        for tx in &block.transactions {
            self.confirmed.insert(tx.tx_id, block.height);
            for input in &tx.inputs {
                self.unspent.remove(input);
                self.spent.insert(*input, (block.height, tx.tx_id));
            }
            for output in &tx.outputs {
                self.unspent.insert(*output, (block.height, tx.tx_id));
            }
        }
        self.best_height = self.best_height.max(block.height);
        self.blocks.push_back(block);

        if self.capacity != 0 && self.blocks.len() > self.capacity {
            if let Some(evicted) = self.blocks.pop_front() {
                self.evict(&evicted);
            }
        }
    }

    fn evict(&mut self, block: &Block) {
        for tx in &block.transactions {
            if self.confirmed.get(&tx.tx_id) == Some(&block.height) {
                self.confirmed.remove(&tx.tx_id);
            }
            for input in &tx.inputs {
                if self.spent.get(input).map(|(height, _)| *height) == Some(block.height) {
                    self.spent.remove(input);
                }
            }
            for output in &tx.outputs {
                if self.unspent.get(output).map(|(height, _)| *height) == Some(block.height) {
                    self.unspent.remove(output);
                }
            }
        }
    }

    /// Whether the UHS id was spent by a cached block.
    pub fn check_spent(&self, uhs_id: &Hash) -> Option<(u64, Hash)> {
        self.spent.get(uhs_id).copied()
    }

    /// Whether the UHS id was created by a cached block and not yet spent.
    pub fn check_unspent(&self, uhs_id: &Hash) -> Option<(u64, Hash)> {
        self.unspent.get(uhs_id).copied()
    }

    /// The height at which a transaction confirmed, if cached.
    pub fn check_tx_id(&self, tx_id: &Hash) -> Option<u64> {
        self.confirmed.get(tx_id).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transactions::CompactTransaction;

    fn block(height: u64, name: &[u8], inputs: Vec<Hash>, outputs: Vec<Hash>) -> Block {
        Block::new(height, vec![CompactTransaction {
            tx_id: Hash::digest(name),
            inputs,
            outputs,
            attestations: Default::default(),
        }])
    }

    #[test]
    fn indexes_spent_and_unspent_ids() {
        let mut cache = BlockCache::new(10);
        let consumed = Hash::digest(b"in");
        let created = Hash::digest(b"out");
        cache.add_block(block(1, b"tx", vec![consumed], vec![created]));

        assert_eq!(cache.check_spent(&consumed), Some((1, Hash::digest(b"tx"))));
        assert_eq!(cache.check_unspent(&created), Some((1, Hash::digest(b"tx"))));
        assert_eq!(cache.check_tx_id(&Hash::digest(b"tx")), Some(1));
        assert_eq!(cache.best_height(), 1);
    }

    #[test]
    fn spending_moves_an_id_out_of_unspent() {
        let mut cache = BlockCache::new(10);
        let id = Hash::digest(b"coin");
        cache.add_block(block(1, b"create", vec![], vec![id]));
        cache.add_block(block(2, b"spend", vec![id], vec![Hash::digest(b"next")]));

        assert!(cache.check_unspent(&id).is_none());
        assert_eq!(cache.check_spent(&id), Some((2, Hash::digest(b"spend"))));
    }

    #[test]
    fn eviction_drops_only_stale_entries() {
        let mut cache = BlockCache::new(2);
        let id = Hash::digest(b"coin");
        cache.add_block(block(1, b"create", vec![], vec![id]));
        cache.add_block(block(2, b"other", vec![], vec![Hash::digest(b"x")]));
        cache.add_block(block(3, b"other2", vec![], vec![Hash::digest(b"y")]));

        // Block 1 evicted: its entries are gone.
        assert!(cache.check_unspent(&id).is_none());
        assert!(cache.check_tx_id(&Hash::digest(b"create")).is_none());
        // Later blocks are still indexed.
        assert_eq!(cache.check_tx_id(&Hash::digest(b"other2")), Some(3));
        assert_eq!(cache.best_height(), 3);
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let mut cache = BlockCache::new(0);
        for height in 1..=100 {
            cache.add_block(block(height, &height.to_le_bytes(), vec![], vec![]));
        }
        assert_eq!(cache.best_height(), 100);
        assert_eq!(cache.check_tx_id(&Hash::digest(&1u64.to_le_bytes())), Some(1));
    }
}
