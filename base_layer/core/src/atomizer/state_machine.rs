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

use std::collections::{BTreeSet, HashSet};

use log::*;

use crate::{
    atomizer::{Atomizer, Block},
    codec::{CodecError, Decode, Encode, Reader},
    replication::StateMachine,
    transactions::CompactTransaction,
    watchtower::TxError,
};

const LOG_TARGET: &str = "c::atomizer::state_machine";

/// A shard's notification that it attested a set of a transaction's input
/// indexes at a given block height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxNotification {
    pub block_height: u64,
    pub tx: CompactTransaction,
    pub attested_inputs: BTreeSet<u64>,
}

/// Commands applied through the replicated log. `MakeBlock` rides the log so
/// every replica agrees on where block boundaries fall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomizerCommand {
    TxNotify(TxNotification),
    AggregateTxNotify(Vec<TxNotification>),
    InsertComplete {
        oldest_attestation_height: u64,
        tx: CompactTransaction,
    },
    MakeBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomizerResponse {
    /// Outcome of one or more notifications: any errors to forward to the
    /// watchtower.
    Inserted { errors: Vec<TxError> },
    /// A freshly cut block plus the expirations it produced.
    Cut { block: Block, errors: Vec<TxError> },
}

/// The atomizer as a replicated state machine.
pub struct AtomizerStateMachine {
    atomizer: Atomizer,
}

impl AtomizerStateMachine {
    pub fn new(atomizer: Atomizer) -> Self {
        Self { atomizer }
    }
}

impl StateMachine for AtomizerStateMachine {
    type Command = AtomizerCommand;
    type Response = AtomizerResponse;

    fn apply(&mut self, command: AtomizerCommand) -> AtomizerResponse {
        match command {
            AtomizerCommand::TxNotify(notification) => {
                let errors = apply_notification(&mut self.atomizer, notification);
                AtomizerResponse::Inserted { errors }
            },
            AtomizerCommand::AggregateTxNotify(notifications) => {
                let mut errors = Vec::new();
                for notification in notifications {
                    errors.extend(apply_notification(&mut self.atomizer, notification));
                }
                AtomizerResponse::Inserted { errors }
            },
            AtomizerCommand::InsertComplete {
                oldest_attestation_height,
                tx,
            } => {
                let errors = match self.atomizer.insert_complete(oldest_attestation_height, tx) {
                    Ok(()) => Vec::new(),
                    Err(err) => vec![err],
                };
                AtomizerResponse::Inserted { errors }
            },
            AtomizerCommand::MakeBlock => {
                let (block, errors) = self.atomizer.make_block();
                debug!(
                    target: LOG_TARGET,
                    "Cut block {} with {} tx(s), {} expiration(s)",
                    block.height,
                    block.transactions.len(),
                    errors.len()
                );
                AtomizerResponse::Cut { block, errors }
            },
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        // Atomizer state is plain data; serialization cannot fail.
        bincode::serialize(&self.atomizer).unwrap_or_default()
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), String> {
        self.atomizer = bincode::deserialize(snapshot).map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn apply_notification(atomizer: &mut Atomizer, notification: TxNotification) -> Vec<TxError> {
    let attested: HashSet<u64> = notification.attested_inputs.into_iter().collect();
    match atomizer.insert(notification.block_height, notification.tx, attested) {
        Ok(()) => Vec::new(),
        Err(err) => vec![err],
    }
}

impl Encode for TxNotification {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.block_height.encode_into(buf);
        self.tx.encode_into(buf);
        self.attested_inputs.encode_into(buf);
    }
}

impl Decode for TxNotification {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            block_height: u64::decode_from(reader)?,
            tx: CompactTransaction::decode_from(reader)?,
            attested_inputs: BTreeSet::decode_from(reader)?,
        })
    }
}

/// Wire requests accepted by the atomizer RPC endpoint. Block cuts are
/// internal (timer-proposed) and deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomizerRequest {
    TxNotify(TxNotification),
    AggregateTxNotify(Vec<TxNotification>),
    InsertComplete {
        oldest_attestation_height: u64,
        tx: CompactTransaction,
    },
}

impl From<AtomizerRequest> for AtomizerCommand {
    fn from(request: AtomizerRequest) -> Self {
        match request {
            AtomizerRequest::TxNotify(notification) => AtomizerCommand::TxNotify(notification),
            AtomizerRequest::AggregateTxNotify(notifications) => AtomizerCommand::AggregateTxNotify(notifications),
            AtomizerRequest::InsertComplete {
                oldest_attestation_height,
                tx,
            } => AtomizerCommand::InsertComplete {
                oldest_attestation_height,
                tx,
            },
        }
    }
}

impl Encode for AtomizerRequest {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            AtomizerRequest::TxNotify(notification) => {
                buf.push(0);
                notification.encode_into(buf);
            },
            AtomizerRequest::AggregateTxNotify(notifications) => {
                buf.push(1);
                notifications.encode_into(buf);
            },
            AtomizerRequest::InsertComplete {
                oldest_attestation_height,
                tx,
            } => {
                buf.push(2);
                oldest_attestation_height.encode_into(buf);
                tx.encode_into(buf);
            },
        }
    }
}

impl Decode for AtomizerRequest {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(AtomizerRequest::TxNotify(TxNotification::decode_from(reader)?)),
            1 => Ok(AtomizerRequest::AggregateTxNotify(Vec::decode_from(reader)?)),
            2 => Ok(AtomizerRequest::InsertComplete {
                oldest_attestation_height: u64::decode_from(reader)?,
                tx: CompactTransaction::decode_from(reader)?,
            }),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "AtomizerRequest",
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use cbdc_common_types::Hash;

    use super::*;
    use crate::replication::{LocalLog, ReplicatedLog};

    fn notification(name: &[u8], height: u64) -> TxNotification {
        TxNotification {
            block_height: height,
            tx: CompactTransaction {
                tx_id: Hash::digest(name),
                inputs: vec![Hash::digest(&[name, b"/in"].concat())],
                outputs: vec![Hash::digest(&[name, b"/out"].concat())],
                attestations: Default::default(),
            },
            attested_inputs: [0].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn commands_drive_the_atomizer_through_the_log() {
        let log = LocalLog::spawn(AtomizerStateMachine::new(Atomizer::new(0, 2)));
        let response = log
            .propose(AtomizerCommand::TxNotify(notification(b"tx", 0)))
            .await
            .unwrap();
        assert_eq!(response, AtomizerResponse::Inserted { errors: vec![] });

        match log.propose(AtomizerCommand::MakeBlock).await.unwrap() {
            AtomizerResponse::Cut { block, errors } => {
                assert_eq!(block.height, 1);
                assert_eq!(block.transactions.len(), 1);
                assert!(errors.is_empty());
            },
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn replica_catches_up_from_snapshot() {
        let log = LocalLog::spawn(AtomizerStateMachine::new(Atomizer::new(0, 2)));
        log.propose(AtomizerCommand::TxNotify(notification(b"tx", 0)))
            .await
            .unwrap();
        let snapshot = log.snapshot().await.unwrap();

        let replica = LocalLog::spawn(AtomizerStateMachine::new(Atomizer::new(0, 2)));
        replica.restore(snapshot).await.unwrap();
        match replica.propose(AtomizerCommand::MakeBlock).await.unwrap() {
            AtomizerResponse::Cut { block, .. } => assert_eq!(block.transactions.len(), 1),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn requests_round_trip() {
        let requests = [
            AtomizerRequest::TxNotify(notification(b"a", 1)),
            AtomizerRequest::AggregateTxNotify(vec![notification(b"b", 2), notification(b"c", 2)]),
            AtomizerRequest::InsertComplete {
                oldest_attestation_height: 9,
                tx: notification(b"d", 0).tx,
            },
        ];
        for request in requests {
            assert_eq!(AtomizerRequest::decode(&request.encode()).unwrap(), request);
        }
    }
}
