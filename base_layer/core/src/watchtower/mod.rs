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

//! Recent-history oracle for clients: indexes the latest blocks and
//! settlement errors and answers status queries about submitted
//! transactions.

mod block_cache;
mod error_cache;
mod status_update;
mod tx_error;

pub use block_cache::BlockCache;
pub use error_cache::ErrorCache;
use log::*;
pub use status_update::{SearchStatus, StatusUpdateRequest, StatusUpdateResponse, StatusUpdateState};
pub use tx_error::{TxError, TxErrorKind};

use crate::{
    atomizer::Block,
    codec::{CodecError, Decode, Encode, Reader},
};

const LOG_TARGET: &str = "c::watchtower";

/// Answers client status queries from a bounded cache of recent blocks and a
/// bounded cache of recent errors.
pub struct Watchtower {
    block_cache: BlockCache,
    error_cache: ErrorCache,
}

impl Watchtower {
    pub fn new(block_cache_size: usize, error_cache_size: usize) -> Self {
        Self {
            block_cache: BlockCache::new(block_cache_size),
            error_cache: ErrorCache::new(error_cache_size),
        }
    }

    pub fn add_block(&mut self, block: Block) {
        trace!(
            target: LOG_TARGET,
            "Indexing block {} with {} tx(s)",
            block.height,
            block.transactions.len()
        );
        self.block_cache.add_block(block);
    }

    /// Record settlement errors. Reports for transactions already visible as
    /// confirmed in the block cache are suppressed: the commit supersedes
    /// any stale failure report.
    pub fn add_errors(&mut self, errors: Vec<TxError>) {
        for error in errors {
            if self.block_cache.check_tx_id(&error.tx_id).is_some() {
                trace!(
                    target: LOG_TARGET,
                    "Suppressing error for confirmed tx {}: {}",
                    error.tx_id,
                    error
                );
                continue;
            }
            self.error_cache.push_error(error);
        }
    }

    pub fn best_block_height(&self) -> u64 {
        self.block_cache.best_height()
    }

    pub fn handle_status_update(&self, request: &StatusUpdateRequest) -> StatusUpdateResponse {
        let mut response = StatusUpdateResponse::default();
        for (tx_id, uhs_ids) in &request.uhs_ids {
            let states = uhs_ids
                .iter()
                .map(|uhs_id| self.check_uhs_id_status(tx_id, uhs_id))
                .collect();
            response.states.insert(*tx_id, states);
        }
        response
    }

    fn check_uhs_id_status(&self, tx_id: &cbdc_common_types::Hash, uhs_id: &cbdc_common_types::Hash) -> StatusUpdateState {
        if let Some(error) = self.error_cache.check_tx_id(tx_id) {
            if error.is_internal() {
                return StatusUpdateState::new(*uhs_id, SearchStatus::InternalError, None);
            }
            let status = match error.offending_inputs() {
                Some(offenders) if offenders.contains(uhs_id) => SearchStatus::InvalidInput,
                _ => SearchStatus::TxRejected,
            };
            return StatusUpdateState::new(*uhs_id, status, None);
        }
        if let Some((height, _)) = self.block_cache.check_spent(uhs_id) {
            return StatusUpdateState::new(*uhs_id, SearchStatus::Spent, Some(height));
        }
        if let Some((height, _)) = self.block_cache.check_unspent(uhs_id) {
            return StatusUpdateState::new(*uhs_id, SearchStatus::Unspent, Some(height));
        }
        StatusUpdateState::new(*uhs_id, SearchStatus::NoHistory, None)
    }
}

/// Wire requests accepted by the watchtower endpoint. `AddErrors` is used by
/// the settlement components, the rest by clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchtowerRequest {
    StatusUpdate(StatusUpdateRequest),
    BestBlockHeight,
    AddErrors(Vec<TxError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchtowerResponse {
    StatusUpdate(StatusUpdateResponse),
    BestBlockHeight(u64),
    Ack,
}

impl Encode for WatchtowerRequest {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            WatchtowerRequest::StatusUpdate(request) => {
                buf.push(0);
                request.encode_into(buf);
            },
            WatchtowerRequest::BestBlockHeight => buf.push(1),
            WatchtowerRequest::AddErrors(errors) => {
                buf.push(2);
                errors.encode_into(buf);
            },
        }
    }
}

impl Decode for WatchtowerRequest {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(WatchtowerRequest::StatusUpdate(StatusUpdateRequest::decode_from(reader)?)),
            1 => Ok(WatchtowerRequest::BestBlockHeight),
            2 => Ok(WatchtowerRequest::AddErrors(Vec::decode_from(reader)?)),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "WatchtowerRequest",
            }),
        }
    }
}

impl Encode for WatchtowerResponse {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            WatchtowerResponse::StatusUpdate(response) => {
                buf.push(0);
                response.encode_into(buf);
            },
            WatchtowerResponse::BestBlockHeight(height) => {
                buf.push(1);
                height.encode_into(buf);
            },
            WatchtowerResponse::Ack => buf.push(2),
        }
    }
}

impl Decode for WatchtowerResponse {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(WatchtowerResponse::StatusUpdate(StatusUpdateResponse::decode_from(
                reader,
            )?)),
            1 => Ok(WatchtowerResponse::BestBlockHeight(u64::decode_from(reader)?)),
            2 => Ok(WatchtowerResponse::Ack),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "WatchtowerResponse",
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use cbdc_common_types::Hash;

    use super::*;
    use crate::transactions::CompactTransaction;

    fn watchtower_with_block() -> (Watchtower, Hash, Hash, Hash) {
        let mut watchtower = Watchtower::new(10, 10);
        let tx_id = Hash::digest(b"tx");
        let consumed = Hash::digest(b"in");
        let created = Hash::digest(b"out");
        watchtower.add_block(Block::new(1, vec![CompactTransaction {
            tx_id,
            inputs: vec![consumed],
            outputs: vec![created],
            attestations: Default::default(),
        }]));
        (watchtower, tx_id, consumed, created)
    }

    fn query(watchtower: &Watchtower, tx_id: Hash, uhs_ids: Vec<Hash>) -> Vec<StatusUpdateState> {
        let mut request = StatusUpdateRequest::default();
        request.uhs_ids.insert(tx_id, uhs_ids);
        let mut response = watchtower.handle_status_update(&request);
        response.states.remove(&tx_id).unwrap_or_default()
    }

    #[test]
    fn reports_spent_and_unspent_with_heights() {
        let (watchtower, tx_id, consumed, created) = watchtower_with_block();
        let states = query(&watchtower, tx_id, vec![consumed, created]);
        assert_eq!(states[0].status, SearchStatus::Spent);
        assert_eq!(states[0].block_height, Some(1));
        assert_eq!(states[1].status, SearchStatus::Unspent);
    }

    #[test]
    fn reports_no_history_for_unknown_ids() {
        let (watchtower, tx_id, ..) = watchtower_with_block();
        let states = query(&watchtower, tx_id, vec![Hash::digest(b"unknown")]);
        assert_eq!(states[0].status, SearchStatus::NoHistory);
        assert_eq!(states[0].block_height, None);
    }

    #[test]
    fn distinguishes_invalid_input_from_rejected() {
        let mut watchtower = Watchtower::new(10, 10);
        let tx_id = Hash::digest(b"bad");
        let offender = Hash::digest(b"spent-coin");
        let innocent = Hash::digest(b"fine-coin");
        watchtower.add_errors(vec![TxError::new(tx_id, TxErrorKind::InputsSpent {
            inputs: [offender].into_iter().collect(),
        })]);

        let states = query(&watchtower, tx_id, vec![offender, innocent]);
        assert_eq!(states[0].status, SearchStatus::InvalidInput);
        assert_eq!(states[1].status, SearchStatus::TxRejected);
    }

    #[test]
    fn internal_errors_override_input_classification() {
        let mut watchtower = Watchtower::new(10, 10);
        let tx_id = Hash::digest(b"stuck");
        watchtower.add_errors(vec![TxError::new(tx_id, TxErrorKind::Sync)]);
        let states = query(&watchtower, tx_id, vec![Hash::digest(b"any")]);
        assert_eq!(states[0].status, SearchStatus::InternalError);
    }

    #[test]
    fn errors_for_confirmed_txs_are_suppressed() {
        let (mut watchtower, tx_id, consumed, _) = watchtower_with_block();
        watchtower.add_errors(vec![TxError::new(tx_id, TxErrorKind::Incomplete)]);
        let states = query(&watchtower, tx_id, vec![consumed]);
        // The confirmed spend wins over the stale error report.
        assert_eq!(states[0].status, SearchStatus::Spent);
    }

    #[test]
    fn tracks_best_block_height() {
        let (watchtower, ..) = watchtower_with_block();
        assert_eq!(watchtower.best_block_height(), 1);
    }

    #[test]
    fn requests_round_trip() {
        let requests = [
            WatchtowerRequest::BestBlockHeight,
            WatchtowerRequest::AddErrors(vec![TxError::new(Hash::digest(b"t"), TxErrorKind::Incomplete)]),
        ];
        for request in requests {
            assert_eq!(WatchtowerRequest::decode(&request.encode()).unwrap(), request);
        }
        let response = WatchtowerResponse::BestBlockHeight(7);
        assert_eq!(WatchtowerResponse::decode(&response.encode()).unwrap(), response);
    }
}
