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

use std::collections::BTreeMap;

use cbdc_common_types::Hash;
use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, Decode, Encode, Reader};

/// The watchtower's verdict on one queried UHS id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchStatus {
    /// The block history scanned contains no trace of the UHS id.
    NoHistory,
    /// The UHS id is in the unspent set; its holder can spend it.
    Unspent,
    /// The UHS id has been spent and cannot be spent again.
    Spent,
    /// The transaction was rejected because of a problem with a different
    /// input.
    TxRejected,
    /// The transaction was rejected because this UHS id was already spent or
    /// never existed.
    InvalidInput,
    /// The system failed internally while handling the transaction; it may
    /// be retried.
    InternalError,
}

/// Status of one UHS id queried under a transaction id, annotated with the
/// block height where one is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateState {
    pub uhs_id: Hash,
    pub status: SearchStatus,
    pub block_height: Option<u64>,
}

impl StatusUpdateState {
    pub fn new(uhs_id: Hash, status: SearchStatus, block_height: Option<u64>) -> Self {
        Self {
            uhs_id,
            status,
            block_height,
        }
    }
}

/// UHS ids to query, keyed by the transaction id they were submitted under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub uhs_ids: BTreeMap<Hash, Vec<Hash>>,
}

/// Per-transaction status of every queried UHS id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateResponse {
    pub states: BTreeMap<Hash, Vec<StatusUpdateState>>,
}

impl Encode for SearchStatus {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        let tag = match self {
            SearchStatus::NoHistory => 0,
            SearchStatus::Unspent => 1,
            SearchStatus::Spent => 2,
            SearchStatus::TxRejected => 3,
            SearchStatus::InvalidInput => 4,
            SearchStatus::InternalError => 5,
        };
        buf.push(tag);
    }
}

impl Decode for SearchStatus {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(SearchStatus::NoHistory),
            1 => Ok(SearchStatus::Unspent),
            2 => Ok(SearchStatus::Spent),
            3 => Ok(SearchStatus::TxRejected),
            4 => Ok(SearchStatus::InvalidInput),
            5 => Ok(SearchStatus::InternalError),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "SearchStatus",
            }),
        }
    }
}

impl Encode for StatusUpdateState {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.uhs_id.encode_into(buf);
        self.status.encode_into(buf);
        self.block_height.encode_into(buf);
    }
}

impl Decode for StatusUpdateState {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            uhs_id: Hash::decode_from(reader)?,
            status: SearchStatus::decode_from(reader)?,
            block_height: Option::decode_from(reader)?,
        })
    }
}

impl Encode for StatusUpdateRequest {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.uhs_ids.encode_into(buf);
    }
}

impl Decode for StatusUpdateRequest {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            uhs_ids: BTreeMap::decode_from(reader)?,
        })
    }
}

impl Encode for StatusUpdateResponse {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.states.encode_into(buf);
    }
}

impl Decode for StatusUpdateResponse {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            states: BTreeMap::decode_from(reader)?,
        })
    }
}
