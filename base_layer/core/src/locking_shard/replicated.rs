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

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use cbdc_common_types::Hash;
use thiserror::Error;

use crate::{
    locking_shard::{
        BrokerId,
        LockMode,
        LockingShard,
        ShardError,
        StateUpdate,
        TicketNumber,
        TicketState,
        Value,
    },
    replication::{LocalLog, ReplicatedLog, ReplicationError, StateMachine},
};

/// Errors seen by users of a locking shard, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardClientError {
    #[error("shard error: {0}")]
    Shard(#[from] ShardError),
    /// The shard could not be reached or did not answer in time. Transient;
    /// the driver may retry or roll the ticket back.
    #[error("shard unreachable: {0}")]
    Unreachable(String),
}

impl From<ReplicationError> for ShardClientError {
    fn from(err: ReplicationError) -> Self {
        ShardClientError::Unreachable(err.to_string())
    }
}

/// The locking shard operations the 2PC driver depends on, implemented by
/// the in-process replicated shard and by the RPC client.
#[async_trait]
pub trait LockingShardClient: Send + Sync {
    async fn try_lock(
        &self,
        ticket: TicketNumber,
        broker: BrokerId,
        key: Hash,
        mode: LockMode,
        first_lock: bool,
    ) -> Result<Option<Value>, ShardClientError>;

    async fn prepare(
        &self,
        ticket: TicketNumber,
        broker: BrokerId,
        tx_id: Option<Hash>,
        updates: StateUpdate,
    ) -> Result<(), ShardClientError>;

    async fn commit(&self, ticket: TicketNumber) -> Result<(), ShardClientError>;

    async fn rollback(&self, ticket: TicketNumber) -> Result<(), ShardClientError>;

    async fn finish(&self, ticket: TicketNumber) -> Result<(), ShardClientError>;

    async fn get_tickets(&self, broker: BrokerId) -> Result<BTreeMap<TicketNumber, TicketState>, ShardClientError>;
}

/// State-changing operations ordered through the replicated log before they
/// are applied. `try_lock` is deliberately absent: repeating a lock after a
/// failover rolls forward safely, so lock intent is not made durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockingShardCommand {
    Prepare {
        ticket: TicketNumber,
        broker: BrokerId,
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
}

/// The locking shard as a replicated state machine.
pub struct LockingShardStateMachine {
    shard: Arc<LockingShard>,
}

impl LockingShardStateMachine {
    pub fn new(shard: Arc<LockingShard>) -> Self {
        Self { shard }
    }
}

impl StateMachine for LockingShardStateMachine {
    type Command = LockingShardCommand;
    type Response = Result<(), ShardError>;

    fn apply(&mut self, command: LockingShardCommand) -> Result<(), ShardError> {
        match command {
            LockingShardCommand::Prepare {
                ticket,
                broker,
                tx_id,
                updates,
            } => self.shard.prepare(ticket, broker, tx_id, updates),
            LockingShardCommand::Commit { ticket } => self.shard.commit(ticket),
            LockingShardCommand::Rollback { ticket } => self.shard.rollback(ticket),
            LockingShardCommand::Finish { ticket } => self.shard.finish(ticket),
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.shard.snapshot()).unwrap_or_default()
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), String> {
        let snapshot = bincode::deserialize(snapshot).map_err(|e| e.to_string())?;
        self.shard.restore(snapshot);
        Ok(())
    }
}

/// A locking shard whose state-changing operations are ordered through a
/// replicated log. Lock acquisition is served locally.
pub struct ReplicatedLockingShard {
    shard: Arc<LockingShard>,
    log: LocalLog<LockingShardStateMachine>,
}

impl ReplicatedLockingShard {
    pub fn new(shard: Arc<LockingShard>) -> Self {
        let log = LocalLog::spawn(LockingShardStateMachine::new(shard.clone()));
        Self { shard, log }
    }

    pub fn shard(&self) -> &Arc<LockingShard> {
        &self.shard
    }

    /// Read-only status endpoint: whether a tx id committed here.
    pub fn check_tx_id(&self, tx_id: &Hash) -> bool {
        self.shard.check_tx_id(tx_id)
    }

    /// Read-only status endpoint: whether a UHS id is unspent here.
    pub fn check_unspent(&self, uhs_id: &Hash) -> bool {
        self.shard.check_unspent(uhs_id)
    }
}

#[async_trait]
impl LockingShardClient for ReplicatedLockingShard {
    async fn try_lock(
        &self,
        ticket: TicketNumber,
        broker: BrokerId,
        key: Hash,
        mode: LockMode,
        first_lock: bool,
    ) -> Result<Option<Value>, ShardClientError> {
        Ok(self.shard.try_lock(ticket, broker, key, mode, first_lock).await?)
    }

    async fn prepare(
        &self,
        ticket: TicketNumber,
        broker: BrokerId,
        tx_id: Option<Hash>,
        updates: StateUpdate,
    ) -> Result<(), ShardClientError> {
        self.log
            .propose(LockingShardCommand::Prepare {
                ticket,
                broker,
                tx_id,
                updates,
            })
            .await??;
        Ok(())
    }

    async fn commit(&self, ticket: TicketNumber) -> Result<(), ShardClientError> {
        self.log.propose(LockingShardCommand::Commit { ticket }).await??;
        Ok(())
    }

    async fn rollback(&self, ticket: TicketNumber) -> Result<(), ShardClientError> {
        self.log.propose(LockingShardCommand::Rollback { ticket }).await??;
        Ok(())
    }

    async fn finish(&self, ticket: TicketNumber) -> Result<(), ShardClientError> {
        self.log.propose(LockingShardCommand::Finish { ticket }).await??;
        Ok(())
    }

    async fn get_tickets(&self, broker: BrokerId) -> Result<BTreeMap<TicketNumber, TicketState>, ShardClientError> {
        Ok(self.shard.get_tickets(broker))
    }
}
