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

use async_trait::async_trait;
use cbdc_common_types::Hash;

use crate::{
    codec::{CodecError, Decode, Encode, Reader},
    locking_shard::{
        BrokerId,
        LockMode,
        LockingShardClient,
        ShardClientError,
        ShardError,
        StateUpdate,
        TicketNumber,
        TicketState,
        Value,
    },
    network::RpcClient,
};

/// Wire requests served by a locking shard endpoint. `CheckTxId` and
/// `CheckUnspent` form the read-only status surface used by clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockingShardRequest {
    TryLock {
        ticket: TicketNumber,
        broker_id: BrokerId,
        key: Hash,
        mode: LockMode,
        first_lock: bool,
    },
    Prepare {
        ticket: TicketNumber,
        broker_id: BrokerId,
        tx_id: Option<Hash>,
        updates: StateUpdate,
    },
    Commit {
        ticket: TicketNumber,
    },
    Rollback {
        ticket: TicketNumber,
    },
    Finish {
        ticket: TicketNumber,
    },
    GetTickets {
        broker_id: BrokerId,
    },
    CheckTxId(Hash),
    CheckUnspent(Hash),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockingShardResponse {
    TryLock(Result<Option<Value>, ShardError>),
    Ack(Result<(), ShardError>),
    Tickets(BTreeMap<TicketNumber, TicketState>),
    Bool(bool),
}

impl Encode for LockingShardRequest {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            LockingShardRequest::TryLock {
                ticket,
                broker_id,
                key,
                mode,
                first_lock,
            } => {
                buf.push(0);
                ticket.encode_into(buf);
                broker_id.encode_into(buf);
                key.encode_into(buf);
                mode.encode_into(buf);
                first_lock.encode_into(buf);
            },
            LockingShardRequest::Prepare {
                ticket,
                broker_id,
                tx_id,
                updates,
            } => {
                buf.push(1);
                ticket.encode_into(buf);
                broker_id.encode_into(buf);
                tx_id.encode_into(buf);
                updates.encode_into(buf);
            },
            LockingShardRequest::Commit { ticket } => {
                buf.push(2);
                ticket.encode_into(buf);
            },
            LockingShardRequest::Rollback { ticket } => {
                buf.push(3);
                ticket.encode_into(buf);
            },
            LockingShardRequest::Finish { ticket } => {
                buf.push(4);
                ticket.encode_into(buf);
            },
            LockingShardRequest::GetTickets { broker_id } => {
                buf.push(5);
                broker_id.encode_into(buf);
            },
            LockingShardRequest::CheckTxId(tx_id) => {
                buf.push(6);
                tx_id.encode_into(buf);
            },
            LockingShardRequest::CheckUnspent(uhs_id) => {
                buf.push(7);
                uhs_id.encode_into(buf);
            },
        }
    }
}

impl Decode for LockingShardRequest {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(LockingShardRequest::TryLock {
                ticket: u64::decode_from(reader)?,
                broker_id: u64::decode_from(reader)?,
                key: Hash::decode_from(reader)?,
                mode: LockMode::decode_from(reader)?,
                first_lock: bool::decode_from(reader)?,
            }),
            1 => Ok(LockingShardRequest::Prepare {
                ticket: u64::decode_from(reader)?,
                broker_id: u64::decode_from(reader)?,
                tx_id: Option::decode_from(reader)?,
                updates: BTreeMap::decode_from(reader)?,
            }),
            2 => Ok(LockingShardRequest::Commit {
                ticket: u64::decode_from(reader)?,
            }),
            3 => Ok(LockingShardRequest::Rollback {
                ticket: u64::decode_from(reader)?,
            }),
            4 => Ok(LockingShardRequest::Finish {
                ticket: u64::decode_from(reader)?,
            }),
            5 => Ok(LockingShardRequest::GetTickets {
                broker_id: u64::decode_from(reader)?,
            }),
            6 => Ok(LockingShardRequest::CheckTxId(Hash::decode_from(reader)?)),
            7 => Ok(LockingShardRequest::CheckUnspent(Hash::decode_from(reader)?)),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "LockingShardRequest",
            }),
        }
    }
}

impl Encode for LockingShardResponse {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            LockingShardResponse::TryLock(result) => {
                buf.push(0);
                result.encode_into(buf);
            },
            LockingShardResponse::Ack(result) => {
                buf.push(1);
                result.encode_into(buf);
            },
            LockingShardResponse::Tickets(tickets) => {
                buf.push(2);
                tickets.encode_into(buf);
            },
            LockingShardResponse::Bool(value) => {
                buf.push(3);
                value.encode_into(buf);
            },
        }
    }
}

impl Decode for LockingShardResponse {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(LockingShardResponse::TryLock(Result::decode_from(reader)?)),
            1 => Ok(LockingShardResponse::Ack(Result::decode_from(reader)?)),
            2 => Ok(LockingShardResponse::Tickets(BTreeMap::decode_from(reader)?)),
            3 => Ok(LockingShardResponse::Bool(bool::decode_from(reader)?)),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "LockingShardResponse",
            }),
        }
    }
}

/// RPC-backed locking shard client used by coordinators to reach remote
/// shards.
pub struct RemoteLockingShard {
    client: RpcClient<LockingShardRequest, LockingShardResponse>,
}

impl RemoteLockingShard {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: RpcClient::new(endpoint),
        }
    }

    async fn call(&self, request: LockingShardRequest) -> Result<LockingShardResponse, ShardClientError> {
        self.client
            .call(&request)
            .await
            .map_err(|e| ShardClientError::Unreachable(e.to_string()))
    }

    async fn call_ack(&self, request: LockingShardRequest) -> Result<(), ShardClientError> {
        match self.call(request).await? {
            LockingShardResponse::Ack(result) => Ok(result?),
            other => Err(ShardClientError::Unreachable(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl LockingShardClient for RemoteLockingShard {
    async fn try_lock(
        &self,
        ticket: TicketNumber,
        broker: BrokerId,
        key: Hash,
        mode: LockMode,
        first_lock: bool,
    ) -> Result<Option<Value>, ShardClientError> {
        match self
            .call(LockingShardRequest::TryLock {
                ticket,
                broker_id: broker,
                key,
                mode,
                first_lock,
            })
            .await?
        {
            LockingShardResponse::TryLock(result) => Ok(result?),
            other => Err(ShardClientError::Unreachable(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    async fn prepare(
        &self,
        ticket: TicketNumber,
        broker: BrokerId,
        tx_id: Option<Hash>,
        updates: StateUpdate,
    ) -> Result<(), ShardClientError> {
        self.call_ack(LockingShardRequest::Prepare {
            ticket,
            broker_id: broker,
            tx_id,
            updates,
        })
        .await
    }

    async fn commit(&self, ticket: TicketNumber) -> Result<(), ShardClientError> {
        self.call_ack(LockingShardRequest::Commit { ticket }).await
    }

    async fn rollback(&self, ticket: TicketNumber) -> Result<(), ShardClientError> {
        self.call_ack(LockingShardRequest::Rollback { ticket }).await
    }

    async fn finish(&self, ticket: TicketNumber) -> Result<(), ShardClientError> {
        self.call_ack(LockingShardRequest::Finish { ticket }).await
    }

    async fn get_tickets(&self, broker: BrokerId) -> Result<BTreeMap<TicketNumber, TicketState>, ShardClientError> {
        match self.call(LockingShardRequest::GetTickets { broker_id: broker }).await? {
            LockingShardResponse::Tickets(tickets) => Ok(tickets),
            other => Err(ShardClientError::Unreachable(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn requests_round_trip() {
        let mut updates = StateUpdate::new();
        updates.insert(Hash::digest(b"in"), None);
        updates.insert(Hash::digest(b"out"), Some(Value::new()));
        let requests = [
            LockingShardRequest::TryLock {
                ticket: 9,
                broker_id: 2,
                key: Hash::digest(b"k"),
                mode: LockMode::Write,
                first_lock: true,
            },
            LockingShardRequest::Prepare {
                ticket: 9,
                broker_id: 2,
                tx_id: Some(Hash::digest(b"tx")),
                updates,
            },
            LockingShardRequest::Commit { ticket: 9 },
            LockingShardRequest::Rollback { ticket: 9 },
            LockingShardRequest::Finish { ticket: 9 },
            LockingShardRequest::GetTickets { broker_id: 2 },
            LockingShardRequest::CheckTxId(Hash::digest(b"tx")),
            LockingShardRequest::CheckUnspent(Hash::digest(b"u")),
        ];
        for request in requests {
            assert_eq!(LockingShardRequest::decode(&request.encode()).unwrap(), request);
        }
    }

    #[test]
    fn responses_round_trip() {
        let responses = [
            LockingShardResponse::TryLock(Ok(Some(Value::new()))),
            LockingShardResponse::TryLock(Err(ShardError::Wounded {
                wounding_ticket: 3,
                wounding_key: Hash::digest(b"k"),
            })),
            LockingShardResponse::Ack(Ok(())),
            LockingShardResponse::Ack(Err(ShardError::Committed)),
            LockingShardResponse::Tickets([(4u64, TicketState::Prepared)].into_iter().collect()),
            LockingShardResponse::Bool(true),
        ];
        for response in responses {
            assert_eq!(LockingShardResponse::decode(&response.encode()).unwrap(), response);
        }
    }
}
