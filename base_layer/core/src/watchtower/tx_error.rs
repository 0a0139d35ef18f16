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

use std::collections::BTreeSet;
use std::fmt;

use cbdc_common_types::Hash;
use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, Decode, Encode, Reader};

/// Why the settlement layer could not commit a transaction. Reported by
/// shards and the atomizer, cached by the watchtower for client queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxError {
    pub tx_id: Hash,
    pub kind: TxErrorKind,
}

impl TxError {
    pub fn new(tx_id: Hash, kind: TxErrorKind) -> Self {
        Self { tx_id, kind }
    }

    /// UHS ids specifically implicated by this error, if any.
    pub fn offending_inputs(&self) -> Option<&BTreeSet<Hash>> {
        match &self.kind {
            TxErrorKind::InputsDne { inputs } | TxErrorKind::InputsSpent { inputs } => Some(inputs),
            _ => None,
        }
    }

    /// Whether the failure was internal to the system rather than a problem
    /// with the transaction itself, meaning the client may retry.
    pub fn is_internal(&self) -> bool {
        matches!(self.kind, TxErrorKind::Sync | TxErrorKind::StxoRange)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxErrorKind {
    /// The reporting shard's best block height lags the height the operation
    /// required.
    Sync,
    /// Inputs were not present in the shard's unspent set.
    InputsDne { inputs: BTreeSet<Hash> },
    /// A shard attestation was older than the atomizer's spent-output cache
    /// window.
    StxoRange,
    /// Inputs were already spent within the atomizer's cache window.
    InputsSpent { inputs: BTreeSet<Hash> },
    /// The transaction did not gather attestations covering all of its
    /// inputs before falling out of the cache window.
    Incomplete,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TxErrorKind::Sync => write!(f, "tx {}: shard out of sync", self.tx_id),
            TxErrorKind::InputsDne { inputs } => {
                write!(f, "tx {}: {} input(s) do not exist", self.tx_id, inputs.len())
            },
            TxErrorKind::StxoRange => write!(f, "tx {}: attestation outside STXO cache window", self.tx_id),
            TxErrorKind::InputsSpent { inputs } => {
                write!(f, "tx {}: {} input(s) already spent", self.tx_id, inputs.len())
            },
            TxErrorKind::Incomplete => write!(f, "tx {}: expired awaiting attestations", self.tx_id),
        }
    }
}

impl Encode for TxErrorKind {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            TxErrorKind::Sync => buf.push(0),
            TxErrorKind::InputsDne { inputs } => {
                buf.push(1);
                inputs.encode_into(buf);
            },
            TxErrorKind::StxoRange => buf.push(2),
            TxErrorKind::InputsSpent { inputs } => {
                buf.push(3);
                inputs.encode_into(buf);
            },
            TxErrorKind::Incomplete => buf.push(4),
        }
    }
}

impl Decode for TxErrorKind {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(TxErrorKind::Sync),
            1 => Ok(TxErrorKind::InputsDne {
                inputs: BTreeSet::decode_from(reader)?,
            }),
            2 => Ok(TxErrorKind::StxoRange),
            3 => Ok(TxErrorKind::InputsSpent {
                inputs: BTreeSet::decode_from(reader)?,
            }),
            4 => Ok(TxErrorKind::Incomplete),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "TxErrorKind",
            }),
        }
    }
}

impl Encode for TxError {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.tx_id.encode_into(buf);
        self.kind.encode_into(buf);
    }
}

impl Decode for TxError {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            tx_id: Hash::decode_from(reader)?,
            kind: TxErrorKind::decode_from(reader)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips() {
        let errors = [
            TxError::new(Hash::digest(b"a"), TxErrorKind::Sync),
            TxError::new(
                Hash::digest(b"b"),
                TxErrorKind::InputsSpent {
                    inputs: [Hash::digest(b"u1"), Hash::digest(b"u2")].into_iter().collect(),
                },
            ),
            TxError::new(Hash::digest(b"c"), TxErrorKind::Incomplete),
        ];
        for err in errors {
            assert_eq!(TxError::decode(&err.encode()).unwrap(), err);
        }
    }

    #[test]
    fn classifies_internal_errors() {
        assert!(TxError::new(Hash::zero(), TxErrorKind::Sync).is_internal());
        assert!(TxError::new(Hash::zero(), TxErrorKind::StxoRange).is_internal());
        assert!(!TxError::new(Hash::zero(), TxErrorKind::Incomplete).is_internal());
    }
}
