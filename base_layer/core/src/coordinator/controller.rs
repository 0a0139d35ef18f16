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

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use cbdc_common::ShardRange;
use cbdc_common_types::{Hash, PublicKey};
use futures::future::join_all;
use log::*;
use secp256k1::{All, Secp256k1};
use thiserror::Error;

use crate::{
    coordinator::TicketMachineHandle,
    directory::{self, DirectoryError},
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
    replication::ReplicationError,
    transactions::CompactTransaction,
};

const LOG_TARGET: &str = "c::coordinator";

/// Attempts for a commit that must eventually land once every participant
/// has prepared.
const COMMIT_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Routing failed: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Ticket machine unavailable: {0}")]
    Replication(#[from] ReplicationError),
    #[error("Commit incomplete for ticket {ticket}; recovery will finish it")]
    CommitIncomplete { ticket: TicketNumber },
}

/// Drives two-phase commit across the locking shards for batches of compact
/// transactions. Only the cluster leader executes; a new leader first runs
/// [`Coordinator::recover`].
pub struct Coordinator {
    shards: Vec<Arc<dyn LockingShardClient>>,
    ranges: Vec<ShardRange>,
    tickets: TicketMachineHandle,
    broker_id: BrokerId,
    secp: Secp256k1<All>,
    sentinel_keys: Vec<PublicKey>,
    attestation_threshold: usize,
    lock_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        shards: Vec<Arc<dyn LockingShardClient>>,
        ranges: Vec<ShardRange>,
        broker_id: BrokerId,
        sentinel_keys: Vec<PublicKey>,
        attestation_threshold: usize,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            shards,
            ranges,
            tickets: TicketMachineHandle::spawn(),
            broker_id,
            secp: Secp256k1::new(),
            sentinel_keys,
            attestation_threshold,
            lock_timeout,
        }
    }

    pub fn broker_id(&self) -> BrokerId {
        self.broker_id
    }

    /// Settle one transaction. `Ok(true)` means committed everywhere,
    /// `Ok(false)` means aborted with no state change.
    pub async fn execute(&self, tx: &CompactTransaction) -> Result<bool, CoordinatorError> {
        if self.attestation_threshold > 0
            && !tx.sufficiently_attested(&self.secp, &self.sentinel_keys, self.attestation_threshold)
        {
            debug!(
                target: LOG_TARGET,
                "Rejecting tx {}: insufficient sentinel attestations", tx.tx_id
            );
            return Ok(false);
        }

        let plan = self.plan_keys(tx)?;
        let ticket = self.tickets.assign().await?;
        trace!(target: LOG_TARGET, "Ticket {} assigned to tx {}", ticket, tx.tx_id);

        if !self.lock_all(ticket, &plan).await {
            self.abort(ticket, &plan).await;
            return Ok(false);
        }

        if !self.prepare_all(ticket, tx.tx_id, &plan).await {
            self.abort(ticket, &plan).await;
            return Ok(false);
        }

        self.commit_all(ticket, &plan).await?;
        self.finish_all(ticket, &plan).await;
        trace!(target: LOG_TARGET, "Ticket {} committed for tx {}", ticket, tx.tx_id);
        Ok(true)
    }

    /// Settle a batch concurrently. Each element of the result mirrors the
    /// input: `Some(committed)` or `None` when an internal error prevented a
    /// decision.
    pub async fn execute_batch(&self, txs: &[CompactTransaction]) -> Vec<Option<bool>> {
        join_all(txs.iter().map(|tx| async move {
            match self.execute(tx).await {
                Ok(committed) => Some(committed),
                Err(e) => {
                    warn!(target: LOG_TARGET, "Batch execution error for tx {}: {}", tx.tx_id, e);
                    None
                },
            }
        }))
        .await
    }

    /// Leader-change recovery: query every shard for this broker's
    /// unfinished tickets and drive each to a terminal state. A ticket
    /// committed anywhere commits everywhere; a ticket prepared everywhere
    /// commits; anything else rolls back.
    pub async fn recover(&self) -> Result<(), CoordinatorError> {
        let mut tickets: HashMap<TicketNumber, Vec<(usize, TicketState)>> = HashMap::new();
        for (shard_idx, shard) in self.shards.iter().enumerate() {
            match shard.get_tickets(self.broker_id).await {
                Ok(shard_tickets) => {
                    for (ticket, state) in shard_tickets {
                        tickets.entry(ticket).or_default().push((shard_idx, state));
                    }
                },
                Err(e) => {
                    warn!(
                        target: LOG_TARGET,
                        "Recovery could not reach shard {}: {}", shard_idx, e
                    );
                },
            }
        }

        info!(
            target: LOG_TARGET,
            "Recovering {} unfinished ticket(s) for broker {}",
            tickets.len(),
            self.broker_id
        );

        for (ticket, participants) in tickets {
            let any_committed = participants.iter().any(|(_, s)| *s == TicketState::Committed);
            let any_prepared = participants.iter().any(|(_, s)| *s == TicketState::Prepared);
            let any_undecided = participants
                .iter()
                .any(|(_, s)| matches!(s, TicketState::Begun | TicketState::Wounded));

            if any_committed || (any_prepared && !any_undecided) {
                for (shard_idx, state) in &participants {
                    if *state == TicketState::Prepared {
                        self.drive_commit(ticket, *shard_idx).await;
                    }
                }
            } else {
                for (shard_idx, _) in &participants {
                    if let Err(e) = self.shards[*shard_idx].rollback(ticket).await {
                        warn!(
                            target: LOG_TARGET,
                            "Recovery rollback of ticket {} on shard {} failed: {}", ticket, shard_idx, e
                        );
                    }
                }
            }

            for (shard_idx, _) in &participants {
                if let Err(e) = self.shards[*shard_idx].finish(ticket).await {
                    warn!(
                        target: LOG_TARGET,
                        "Recovery finish of ticket {} on shard {} failed: {}", ticket, shard_idx, e
                    );
                }
            }
        }
        Ok(())
    }

    /// Route the transaction's UHS ids to shards. Inputs are fetched and
    /// checked for existence; outputs are locked and checked vacant.
    fn plan_keys(&self, tx: &CompactTransaction) -> Result<Vec<ShardPlan>, CoordinatorError> {
        let mut plans: BTreeMap<usize, ShardPlan> = BTreeMap::new();
        for input in &tx.inputs {
            let shard_idx = directory::shard_for(input, &self.ranges)?;
            let plan = plans.entry(shard_idx).or_insert_with(|| ShardPlan::new(shard_idx));
            plan.inputs.insert(*input);
        }
        for output in &tx.outputs {
            let shard_idx = directory::shard_for(output, &self.ranges)?;
            let plan = plans.entry(shard_idx).or_insert_with(|| ShardPlan::new(shard_idx));
            plan.outputs.insert(*output);
        }
        Ok(plans.into_values().collect())
    }

    /// Write-lock every key. Returns false if any input is missing, any
    /// output slot is occupied, or any lock fails or times out.
    async fn lock_all(&self, ticket: TicketNumber, plans: &[ShardPlan]) -> bool {
        let results = join_all(plans.iter().map(|plan| self.lock_shard_keys(ticket, plan))).await;
        results.into_iter().all(|ok| ok)
    }

    async fn lock_shard_keys(&self, ticket: TicketNumber, plan: &ShardPlan) -> bool {
        let shard = &self.shards[plan.shard_idx];
        let mut keys = plan
            .inputs
            .iter()
            .map(|k| (*k, true))
            .chain(plan.outputs.iter().map(|k| (*k, false)));

        // The first lock binds the ticket to this broker on the shard; it
        // must land before the concurrent remainder.
        let Some((first_key, first_is_input)) = keys.next() else {
            return true;
        };
        if !self.lock_one(ticket, shard, first_key, first_is_input, true).await {
            return false;
        }

        let rest: Vec<_> = keys.collect();
        let results = join_all(
            rest.into_iter()
                .map(|(key, is_input)| self.lock_one(ticket, shard, key, is_input, false)),
        )
        .await;
        results.into_iter().all(|ok| ok)
    }

    async fn lock_one(
        &self,
        ticket: TicketNumber,
        shard: &Arc<dyn LockingShardClient>,
        key: Hash,
        is_input: bool,
        first_lock: bool,
    ) -> bool {
        let lock = shard.try_lock(ticket, self.broker_id, key, LockMode::Write, first_lock);
        let result = match tokio::time::timeout(self.lock_timeout, lock).await {
            Ok(result) => result,
            Err(_) => {
                debug!(target: LOG_TARGET, "Ticket {} lock timed out on key {}", ticket, key);
                return false;
            },
        };
        match result {
            Ok(value) => {
                // Inputs must exist; outputs must not.
                let ok = if is_input { value.is_some() } else { value.is_none() };
                if !ok {
                    debug!(
                        target: LOG_TARGET,
                        "Ticket {} key {} failed {} check",
                        ticket,
                        key,
                        if is_input { "existence" } else { "vacancy" }
                    );
                }
                ok
            },
            Err(ShardClientError::Shard(ShardError::Wounded {
                wounding_ticket,
                wounding_key,
            })) => {
                debug!(
                    target: LOG_TARGET,
                    "Ticket {} wounded by {} at {}; aborting", ticket, wounding_ticket, wounding_key
                );
                false
            },
            Err(e) => {
                debug!(target: LOG_TARGET, "Ticket {} lock failed on key {}: {}", ticket, key, e);
                false
            },
        }
    }

    async fn prepare_all(&self, ticket: TicketNumber, tx_id: Hash, plans: &[ShardPlan]) -> bool {
        let results = join_all(plans.iter().map(|plan| {
            let mut updates = StateUpdate::new();
            for input in &plan.inputs {
                updates.insert(*input, None);
            }
            for output in &plan.outputs {
                updates.insert(*output, Some(Value::new()));
            }
            let shard = &self.shards[plan.shard_idx];
            async move { shard.prepare(ticket, self.broker_id, Some(tx_id), updates).await }
        }))
        .await;

        for (plan, result) in plans.iter().zip(&results) {
            if let Err(e) = result {
                debug!(
                    target: LOG_TARGET,
                    "Ticket {} prepare failed on shard {}: {}", ticket, plan.shard_idx, e
                );
            }
        }
        results.iter().all(Result::is_ok)
    }

    /// Commit on every participant. After a full prepare this must succeed;
    /// stubborn shards are retried and finally left to recovery.
    async fn commit_all(&self, ticket: TicketNumber, plans: &[ShardPlan]) -> Result<(), CoordinatorError> {
        let results = join_all(plans.iter().map(|plan| self.drive_commit(ticket, plan.shard_idx))).await;
        if results.into_iter().all(|ok| ok) {
            Ok(())
        } else {
            Err(CoordinatorError::CommitIncomplete { ticket })
        }
    }

    /// Commit with bounded retries. A `Committed` error means a duplicate
    /// delivery already landed and counts as success.
    async fn drive_commit(&self, ticket: TicketNumber, shard_idx: usize) -> bool {
        let shard = &self.shards[shard_idx];
        for attempt in 0..COMMIT_RETRIES {
            match shard.commit(ticket).await {
                Ok(()) => return true,
                Err(ShardClientError::Shard(ShardError::Committed)) => return true,
                Err(ShardClientError::Unreachable(e)) => {
                    debug!(
                        target: LOG_TARGET,
                        "Commit attempt {} for ticket {} on shard {} failed: {}", attempt, ticket, shard_idx, e
                    );
                },
                Err(e) => {
                    error!(
                        target: LOG_TARGET,
                        "Commit of ticket {} on shard {} rejected: {}", ticket, shard_idx, e
                    );
                    return false;
                },
            }
        }
        false
    }

    async fn abort(&self, ticket: TicketNumber, plans: &[ShardPlan]) {
        join_all(plans.iter().map(|plan| async move {
            let shard = &self.shards[plan.shard_idx];
            if let Err(e) = shard.rollback(ticket).await {
                warn!(
                    target: LOG_TARGET,
                    "Rollback of ticket {} on shard {} failed: {}", ticket, plan.shard_idx, e
                );
            }
        }))
        .await;
        self.finish_all(ticket, plans).await;
    }

    async fn finish_all(&self, ticket: TicketNumber, plans: &[ShardPlan]) {
        join_all(plans.iter().map(|plan| async move {
            let shard = &self.shards[plan.shard_idx];
            if let Err(e) = shard.finish(ticket).await {
                warn!(
                    target: LOG_TARGET,
                    "Finish of ticket {} on shard {} failed: {}", ticket, plan.shard_idx, e
                );
            }
        }))
        .await;
    }
}

struct ShardPlan {
    shard_idx: usize,
    inputs: BTreeSet<Hash>,
    outputs: BTreeSet<Hash>,
}

impl ShardPlan {
    fn new(shard_idx: usize) -> Self {
        Self {
            shard_idx,
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
        }
    }
}
