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

//! Two-phase-commit locking shard: an authoritative, range-partitioned,
//! consensus-replicated store of unspent ids with key-level locks, wound-wait
//! deadlock avoidance and a per-ticket prepare/commit/rollback/finish state
//! machine.

mod messages;
mod replicated;
#[allow(clippy::module_inception)]
mod shard;

use std::collections::BTreeMap;

use cbdc_common_types::Hash;
pub use messages::{LockingShardRequest, LockingShardResponse, RemoteLockingShard};
pub use replicated::{
    LockingShardClient,
    LockingShardCommand,
    LockingShardStateMachine,
    ReplicatedLockingShard,
    ShardClientError,
};
use serde::{Deserialize, Serialize};
pub use shard::LockingShard;
use thiserror::Error;

use crate::codec::{CodecError, Decode, Encode, Reader};

/// Monotonically increasing identity of a distributed transaction.
pub type TicketNumber = u64;

/// Identity of the coordinator (broker) driving a ticket, used to route
/// recovery after a leader change.
pub type BrokerId = u64;

/// Value stored against a key. Unspent-id semantics only need presence, so
/// values are opaque bytes and usually empty.
pub type Value = Vec<u8>;

/// Mutations staged by `prepare`: `Some` writes the value, `None` deletes
/// the key.
pub type StateUpdate = BTreeMap<Hash, Option<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

/// Shard-local state of a ticket. `finish` forgets the ticket entirely, so
/// there is no terminal variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketState {
    Begun,
    Wounded,
    Prepared,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ShardError {
    #[error("key not in this shard's range")]
    NotInRange,
    #[error("unknown ticket")]
    UnknownTicket,
    #[error("wounded by ticket {wounding_ticket} at key {wounding_key}")]
    Wounded {
        wounding_ticket: TicketNumber,
        wounding_key: Hash,
    },
    #[error("ticket is not prepared")]
    NotPrepared,
    #[error("ticket is already prepared")]
    Prepared,
    #[error("ticket is already committed")]
    Committed,
    #[error("ticket is aborted")]
    Aborted,
    #[error("ticket is still begun")]
    Begun,
    #[error("key {key} is not write-locked by the ticket")]
    NotLocked { key: Hash },
}

impl Encode for LockMode {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(match self {
            LockMode::Read => 0,
            LockMode::Write => 1,
        });
    }
}

impl Decode for LockMode {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(LockMode::Read),
            1 => Ok(LockMode::Write),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "LockMode",
            }),
        }
    }
}

impl Encode for TicketState {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(match self {
            TicketState::Begun => 0,
            TicketState::Wounded => 1,
            TicketState::Prepared => 2,
            TicketState::Committed => 3,
            TicketState::Aborted => 4,
        });
    }
}

impl Decode for TicketState {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(TicketState::Begun),
            1 => Ok(TicketState::Wounded),
            2 => Ok(TicketState::Prepared),
            3 => Ok(TicketState::Committed),
            4 => Ok(TicketState::Aborted),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "TicketState",
            }),
        }
    }
}

impl Encode for ShardError {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            ShardError::NotInRange => buf.push(0),
            ShardError::UnknownTicket => buf.push(1),
            ShardError::Wounded {
                wounding_ticket,
                wounding_key,
            } => {
                buf.push(2);
                wounding_ticket.encode_into(buf);
                wounding_key.encode_into(buf);
            },
            ShardError::NotPrepared => buf.push(3),
            ShardError::Prepared => buf.push(4),
            ShardError::Committed => buf.push(5),
            ShardError::Aborted => buf.push(6),
            ShardError::Begun => buf.push(7),
            ShardError::NotLocked { key } => {
                buf.push(8);
                key.encode_into(buf);
            },
        }
    }
}

impl Decode for ShardError {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(ShardError::NotInRange),
            1 => Ok(ShardError::UnknownTicket),
            2 => Ok(ShardError::Wounded {
                wounding_ticket: u64::decode_from(reader)?,
                wounding_key: Hash::decode_from(reader)?,
            }),
            3 => Ok(ShardError::NotPrepared),
            4 => Ok(ShardError::Prepared),
            5 => Ok(ShardError::Committed),
            6 => Ok(ShardError::Aborted),
            7 => Ok(ShardError::Begun),
            8 => Ok(ShardError::NotLocked {
                key: Hash::decode_from(reader)?,
            }),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "ShardError",
            }),
        }
    }
}
