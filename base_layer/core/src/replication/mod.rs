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

//! Consensus-replicated state machines behind a "replicated log with
//! snapshots" abstraction. Components propose commands; every replica
//! applies committed commands in log order. Raft transport and persistence
//! are collaborators outside the settlement core; [`LocalLog`] provides the
//! single-process implementation used by the daemons and tests.

use async_trait::async_trait;
use log::*;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const LOG_TARGET: &str = "c::replication";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("Replicated log has shut down")]
    ShutDown,
    #[error("Node is not the leader")]
    NotLeader,
}

/// A deterministic state machine driven by a replicated log. `apply` is
/// called with every committed entry in log order on every replica.
pub trait StateMachine: Send + 'static {
    type Command: Send + 'static;
    type Response: Send + 'static;

    fn apply(&mut self, command: Self::Command) -> Self::Response;

    /// Serialized copy of the full state, for replica catch-up.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the state with a previously taken snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> Result<(), String>;
}

/// Handle for proposing commands to a replicated state machine.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    type Command: Send + 'static;
    type Response: Send + 'static;

    /// Append a command to the log and resolve with the state machine's
    /// response once the command has been applied.
    async fn propose(&self, command: Self::Command) -> Result<Self::Response, ReplicationError>;

    /// Whether this node currently leads the replica group. Followers must
    /// not accept external operations.
    fn is_leader(&self) -> bool;
}

enum LogRequest<M: StateMachine> {
    Apply(M::Command, oneshot::Sender<M::Response>),
    Snapshot(oneshot::Sender<Vec<u8>>),
    Restore(Vec<u8>, oneshot::Sender<Result<(), String>>),
}

/// Single-process replicated log: commands are applied serially by a
/// dedicated task that is sole owner of the state machine, preserving the
/// ordering contract replicas rely on.
pub struct LocalLog<M: StateMachine> {
    sender: mpsc::Sender<LogRequest<M>>,
}

impl<M: StateMachine> Clone for LocalLog<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

const LOG_QUEUE_DEPTH: usize = 1024;

impl<M: StateMachine> LocalLog<M> {
    /// Spawn the apply loop and return a handle to it.
    pub fn spawn(mut state_machine: M) -> Self {
        let (sender, mut receiver) = mpsc::channel::<LogRequest<M>>(LOG_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                match request {
                    LogRequest::Apply(command, reply) => {
                        let response = state_machine.apply(command);
                        let _ = reply.send(response);
                    },
                    LogRequest::Snapshot(reply) => {
                        let _ = reply.send(state_machine.snapshot());
                    },
                    LogRequest::Restore(snapshot, reply) => {
                        let result = state_machine.restore(&snapshot);
                        if let Err(ref e) = result {
                            error!(target: LOG_TARGET, "Snapshot restore failed: {}", e);
                        }
                        let _ = reply.send(result);
                    },
                }
            }
            debug!(target: LOG_TARGET, "Apply loop terminated");
        });
        Self { sender }
    }

    pub async fn snapshot(&self) -> Result<Vec<u8>, ReplicationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(LogRequest::Snapshot(reply_tx))
            .await
            .map_err(|_| ReplicationError::ShutDown)?;
        reply_rx.await.map_err(|_| ReplicationError::ShutDown)
    }

    pub async fn restore(&self, snapshot: Vec<u8>) -> Result<(), ReplicationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(LogRequest::Restore(snapshot, reply_tx))
            .await
            .map_err(|_| ReplicationError::ShutDown)?;
        reply_rx
            .await
            .map_err(|_| ReplicationError::ShutDown)?
            .map_err(|_| ReplicationError::ShutDown)
    }
}

#[async_trait]
impl<M: StateMachine> ReplicatedLog for LocalLog<M> {
    type Command = M::Command;
    type Response = M::Response;

    async fn propose(&self, command: Self::Command) -> Result<Self::Response, ReplicationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(LogRequest::Apply(command, reply_tx))
            .await
            .map_err(|_| ReplicationError::ShutDown)?;
        reply_rx.await.map_err(|_| ReplicationError::ShutDown)
    }

    fn is_leader(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Counter {
        total: u64,
    }

    impl StateMachine for Counter {
        type Command = u64;
        type Response = u64;

        fn apply(&mut self, command: u64) -> u64 {
            self.total += command;
            self.total
        }

        fn snapshot(&self) -> Vec<u8> {
            self.total.to_le_bytes().to_vec()
        }

        fn restore(&mut self, snapshot: &[u8]) -> Result<(), String> {
            let bytes: [u8; 8] = snapshot.try_into().map_err(|_| "bad snapshot".to_owned())?;
            self.total = u64::from_le_bytes(bytes);
            Ok(())
        }
    }

    #[tokio::test]
    async fn applies_commands_in_order() {
        let log = LocalLog::spawn(Counter { total: 0 });
        assert_eq!(log.propose(1).await.unwrap(), 1);
        assert_eq!(log.propose(2).await.unwrap(), 3);
        assert_eq!(log.propose(3).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn snapshot_and_restore_round_trip() {
        let log = LocalLog::spawn(Counter { total: 0 });
        log.propose(41).await.unwrap();
        let snapshot = log.snapshot().await.unwrap();

        let replica = LocalLog::spawn(Counter { total: 0 });
        replica.restore(snapshot).await.unwrap();
        assert_eq!(replica.propose(1).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn local_log_claims_leadership() {
        let log = LocalLog::spawn(Counter { total: 0 });
        assert!(log.is_leader());
    }
}
