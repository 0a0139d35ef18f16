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

use crate::watchtower::TxError;

/// Bounded FIFO of recent settlement errors, indexed by transaction id and
/// by each specifically implicated UHS id. Only the newest `capacity`
/// errors are retained.
pub struct ErrorCache {
    capacity: usize,
    errors: VecDeque<TxError>,
    by_tx: HashMap<Hash, TxError>,
    by_uhs: HashMap<Hash, TxError>,
}

impl ErrorCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            errors: VecDeque::new(),
            by_tx: HashMap::new(),
            by_uhs: HashMap::new(),
        }
    }

    pub fn push_error(&mut self, error: TxError) {
        if self.capacity == 0 {
            return;
        }
        if self.errors.len() == self.capacity {
            if let Some(evicted) = self.errors.pop_front() {
                self.forget(&evicted);
            }
        }
        self.by_tx.insert(error.tx_id, error.clone());
        if let Some(offenders) = error.offending_inputs() {
            for uhs_id in offenders {
                self.by_uhs.insert(*uhs_id, error.clone());
            }
        }
        self.errors.push_back(error);
    }

    pub fn push_errors(&mut self, errors: Vec<TxError>) {
        for error in errors {
            self.push_error(error);
        }
    }

    /// The most recent error recorded for a transaction.
    pub fn check_tx_id(&self, tx_id: &Hash) -> Option<&TxError> {
        self.by_tx.get(tx_id)
    }

    /// The most recent error specifically naming a UHS id.
    pub fn check_uhs_id(&self, uhs_id: &Hash) -> Option<&TxError> {
        self.by_uhs.get(uhs_id)
    }

    fn forget(&mut self, evicted: &TxError) {
        if self.by_tx.get(&evicted.tx_id) == Some(evicted) {
            self.by_tx.remove(&evicted.tx_id);
        }
        if let Some(offenders) = evicted.offending_inputs() {
            for uhs_id in offenders {
                if self.by_uhs.get(uhs_id) == Some(evicted) {
                    self.by_uhs.remove(uhs_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::watchtower::TxErrorKind;

    #[test]
    fn indexes_by_tx_and_offending_input() {
        let mut cache = ErrorCache::new(4);
        let offender = Hash::digest(b"uhs");
        let error = TxError::new(Hash::digest(b"tx"), TxErrorKind::InputsSpent {
            inputs: [offender].into_iter().collect(),
        });
        cache.push_error(error.clone());

        assert_eq!(cache.check_tx_id(&Hash::digest(b"tx")), Some(&error));
        assert_eq!(cache.check_uhs_id(&offender), Some(&error));
        assert!(cache.check_uhs_id(&Hash::digest(b"other")).is_none());
    }

    #[test]
    fn keeps_only_the_newest_errors() {
        let mut cache = ErrorCache::new(2);
        for i in 0..3u64 {
            cache.push_error(TxError::new(Hash::digest(&i.to_le_bytes()), TxErrorKind::Sync));
        }
        assert!(cache.check_tx_id(&Hash::digest(&0u64.to_le_bytes())).is_none());
        assert!(cache.check_tx_id(&Hash::digest(&1u64.to_le_bytes())).is_some());
        assert!(cache.check_tx_id(&Hash::digest(&2u64.to_le_bytes())).is_some());
    }

    #[test]
    fn eviction_keeps_newer_entry_for_same_tx() {
        let mut cache = ErrorCache::new(2);
        let tx_id = Hash::digest(b"tx");
        cache.push_error(TxError::new(tx_id, TxErrorKind::Sync));
        cache.push_error(TxError::new(tx_id, TxErrorKind::Incomplete));
        // Push a third error, evicting the first Sync entry.
        cache.push_error(TxError::new(Hash::digest(b"other"), TxErrorKind::Sync));

        assert_eq!(
            cache.check_tx_id(&tx_id),
            Some(&TxError::new(tx_id, TxErrorKind::Incomplete))
        );
    }
}
