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

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use cbdc_common::ShardRange;
use cbdc_common_types::Hash;
use log::*;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::locking_shard::{BrokerId, LockMode, ShardError, StateUpdate, TicketNumber, TicketState, Value};

const LOG_TARGET: &str = "c::locking_shard";

struct Waiter {
    ticket: TicketNumber,
    mode: LockMode,
    reply: oneshot::Sender<Result<Option<Value>, ShardError>>,
}

#[derive(Default)]
struct KeyEntry {
    /// Committed value; `None` while the key exists only as a lock target.
    value: Option<Value>,
    readers: BTreeSet<TicketNumber>,
    writer: Option<TicketNumber>,
    /// Pending lock requests ordered by ticket number, so older tickets are
    /// always granted first.
    queue: VecDeque<Waiter>,
}

impl KeyEntry {
    fn is_idle(&self) -> bool {
        self.value.is_none() && self.readers.is_empty() && self.writer.is_none() && self.queue.is_empty()
    }
}

struct TicketEntry {
    state: TicketState,
    broker: BrokerId,
    /// Keys this ticket holds locks on.
    held: BTreeSet<Hash>,
    /// Keys this ticket is queued on.
    waiting: HashSet<Hash>,
    staged: StateUpdate,
    tx_id: Option<Hash>,
    wounded_by: Option<(TicketNumber, Hash)>,
}

impl TicketEntry {
    fn new(broker: BrokerId) -> Self {
        Self {
            state: TicketState::Begun,
            broker,
            held: BTreeSet::new(),
            waiting: HashSet::new(),
            staged: StateUpdate::new(),
            tx_id: None,
            wounded_by: None,
        }
    }

    fn wounded_error(&self) -> ShardError {
        match self.wounded_by {
            Some((wounding_ticket, wounding_key)) => ShardError::Wounded {
                wounding_ticket,
                wounding_key,
            },
            // Wounded state always records its cause; fall back to a state
            // error if it somehow did not.
            None => ShardError::Begun,
        }
    }
}

#[derive(Default)]
struct Inner {
    keys: HashMap<Hash, KeyEntry>,
    tickets: HashMap<TicketNumber, TicketEntry>,
    completed_txs: HashSet<Hash>,
}

/// Durable shard state carried by replication snapshots. Lock queues are
/// deliberately absent: waiters belong to connections that do not survive a
/// failover.
#[derive(Serialize, Deserialize)]
pub(super) struct ShardSnapshot {
    pub values: BTreeMap<Hash, Value>,
    pub tickets: BTreeMap<TicketNumber, SnapshotTicket>,
    pub completed_txs: BTreeSet<Hash>,
}

#[derive(Serialize, Deserialize)]
pub(super) struct SnapshotTicket {
    pub state: TicketState,
    pub broker: BrokerId,
    pub held: BTreeSet<Hash>,
    pub staged: StateUpdate,
    pub tx_id: Option<Hash>,
}

/// The locking shard proper. All key, ticket and broker bookkeeping hangs
/// off one internal lock; `try_lock` suspends outside it while waiting for a
/// conflicting holder to release.
pub struct LockingShard {
    range: ShardRange,
    inner: Mutex<Inner>,
}

impl LockingShard {
    pub fn new(range: ShardRange) -> Self {
        Self {
            range,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn range(&self) -> ShardRange {
        self.range
    }

    /// Seed committed values directly, bypassing the ticket machinery. Used
    /// to establish genesis outputs.
    pub fn seed(&self, uhs_ids: impl IntoIterator<Item = Hash>) {
        let mut inner = self.lock_inner();
        for uhs_id in uhs_ids {
            if self.range.contains(&uhs_id) {
                inner.keys.entry(uhs_id).or_default().value = Some(Value::new());
            }
        }
    }

    /// Lock `key` for `ticket` and return its current value. Suspends while
    /// a conflicting older ticket holds the key; conflicting younger holders
    /// are wounded. `first_lock` binds the ticket to its broker for
    /// recovery.
    pub async fn try_lock(
        &self,
        ticket: TicketNumber,
        broker: BrokerId,
        key: Hash,
        mode: LockMode,
        first_lock: bool,
    ) -> Result<Option<Value>, ShardError> {
        let wait_rx = {
            let mut inner = self.lock_inner();

            if !self.range.contains(&key) {
                return Err(ShardError::NotInRange);
            }

            match inner.tickets.get(&ticket) {
                None if first_lock => {
                    inner.tickets.insert(ticket, TicketEntry::new(broker));
                },
                None => return Err(ShardError::UnknownTicket),
                Some(entry) => match entry.state {
                    TicketState::Begun => {},
                    TicketState::Wounded => return Err(entry.wounded_error()),
                    TicketState::Prepared => return Err(ShardError::Prepared),
                    TicketState::Committed => return Err(ShardError::Committed),
                    TicketState::Aborted => return Err(ShardError::Aborted),
                },
            }

            match inner.acquire_or_enqueue(ticket, key, mode) {
                Acquire::Granted(value) => return Ok(value),
                Acquire::Wait(rx) => rx,
            }
        };

        // Suspended until a release grants the lock, the ticket is wounded,
        // or the ticket is rolled back (sender dropped).
        match wait_rx.await {
            Ok(result) => result,
            Err(_) => Err(ShardError::Aborted),
        }
    }

    /// Stage `updates` to apply at commit. Every mutated key must be
    /// write-locked by the ticket.
    pub fn prepare(
        &self,
        ticket: TicketNumber,
        _broker: BrokerId,
        tx_id: Option<Hash>,
        updates: StateUpdate,
    ) -> Result<(), ShardError> {
        let mut inner = self.lock_inner();

        {
            let entry = inner.tickets.get(&ticket).ok_or(ShardError::UnknownTicket)?;
            match entry.state {
                TicketState::Begun => {},
                TicketState::Wounded => return Err(entry.wounded_error()),
                TicketState::Prepared => return Err(ShardError::Prepared),
                TicketState::Committed => return Err(ShardError::Committed),
                TicketState::Aborted => return Err(ShardError::Aborted),
            }
            for key in updates.keys() {
                if !self.range.contains(key) {
                    return Err(ShardError::NotInRange);
                }
                let held_for_write = inner
                    .keys
                    .get(key)
                    .map(|k| k.writer == Some(ticket))
                    .unwrap_or(false);
                if !held_for_write {
                    return Err(ShardError::NotLocked { key: *key });
                }
            }
        }

        if let Some(entry) = inner.tickets.get_mut(&ticket) {
            entry.staged = updates;
            entry.tx_id = tx_id;
            entry.state = TicketState::Prepared;
        }
        trace!(target: LOG_TARGET, "Ticket {} prepared", ticket);
        Ok(())
    }

    /// Apply the staged updates and release the ticket's locks.
    pub fn commit(&self, ticket: TicketNumber) -> Result<(), ShardError> {
        let mut inner = self.lock_inner();

        let entry = inner.tickets.get_mut(&ticket).ok_or(ShardError::UnknownTicket)?;
        match entry.state {
            TicketState::Prepared => {},
            TicketState::Committed => return Err(ShardError::Committed),
            TicketState::Begun => return Err(ShardError::NotPrepared),
            TicketState::Wounded => return Err(entry.wounded_error()),
            TicketState::Aborted => return Err(ShardError::Aborted),
        }

        let staged = std::mem::take(&mut entry.staged);
        let tx_id = entry.tx_id.take();
        entry.state = TicketState::Committed;

        for (key, update) in staged {
            let key_entry = inner.keys.entry(key).or_default();
            key_entry.value = update;
        }
        if let Some(tx_id) = tx_id {
            inner.completed_txs.insert(tx_id);
        }
        inner.release_locks(ticket);
        trace!(target: LOG_TARGET, "Ticket {} committed", ticket);
        Ok(())
    }

    /// Discard staged updates and release locks without applying. Idempotent
    /// on aborted and unknown tickets.
    pub fn rollback(&self, ticket: TicketNumber) -> Result<(), ShardError> {
        let mut inner = self.lock_inner();

        let Some(entry) = inner.tickets.get_mut(&ticket) else {
            return Ok(());
        };
        match entry.state {
            TicketState::Begun | TicketState::Wounded | TicketState::Prepared => {},
            TicketState::Aborted => return Ok(()),
            TicketState::Committed => return Err(ShardError::Committed),
        }

        entry.staged.clear();
        entry.tx_id = None;
        entry.state = TicketState::Aborted;
        inner.drop_waiters(ticket);
        inner.release_locks(ticket);
        trace!(target: LOG_TARGET, "Ticket {} rolled back", ticket);
        Ok(())
    }

    /// Forget a terminal ticket. Finishing an unknown (or already finished)
    /// ticket is Ok so finish can be delivered at least once.
    pub fn finish(&self, ticket: TicketNumber) -> Result<(), ShardError> {
        let mut inner = self.lock_inner();

        let Some(entry) = inner.tickets.get(&ticket) else {
            return Ok(());
        };
        match entry.state {
            TicketState::Committed | TicketState::Aborted => {
                inner.tickets.remove(&ticket);
                trace!(target: LOG_TARGET, "Ticket {} finished", ticket);
                Ok(())
            },
            TicketState::Prepared => Err(ShardError::Prepared),
            TicketState::Begun => Err(ShardError::Begun),
            TicketState::Wounded => Err(entry.wounded_error()),
        }
    }

    /// Unfinished tickets bound to `broker`, for recovery.
    pub fn get_tickets(&self, broker: BrokerId) -> BTreeMap<TicketNumber, TicketState> {
        let inner = self.lock_inner();
        inner
            .tickets
            .iter()
            .filter(|(_, entry)| entry.broker == broker)
            .map(|(ticket, entry)| (*ticket, entry.state))
            .collect()
    }

    /// Read-only: whether a transaction id was committed on this shard.
    pub fn check_tx_id(&self, tx_id: &Hash) -> bool {
        self.lock_inner().completed_txs.contains(tx_id)
    }

    /// Read-only: whether a UHS id currently has a committed value.
    pub fn check_unspent(&self, uhs_id: &Hash) -> bool {
        self.lock_inner()
            .keys
            .get(uhs_id)
            .map(|entry| entry.value.is_some())
            .unwrap_or(false)
    }

    pub(super) fn snapshot(&self) -> ShardSnapshot {
        let inner = self.lock_inner();
        ShardSnapshot {
            values: inner
                .keys
                .iter()
                .filter_map(|(key, entry)| entry.value.clone().map(|v| (*key, v)))
                .collect(),
            tickets: inner
                .tickets
                .iter()
                .map(|(ticket, entry)| {
                    (*ticket, SnapshotTicket {
                        state: entry.state,
                        broker: entry.broker,
                        held: entry.held.clone(),
                        staged: entry.staged.clone(),
                        tx_id: entry.tx_id,
                    })
                })
                .collect(),
            completed_txs: inner.completed_txs.iter().copied().collect(),
        }
    }

    pub(super) fn restore(&self, snapshot: ShardSnapshot) {
        let mut inner = self.lock_inner();
        let mut keys: HashMap<Hash, KeyEntry> = HashMap::new();
        for (key, value) in snapshot.values {
            keys.entry(key).or_default().value = Some(value);
        }
        let mut tickets = HashMap::new();
        for (ticket, snap) in snapshot.tickets {
            for key in &snap.held {
                // Re-establish the locks the ticket held; waiters are gone.
                let entry = keys.entry(*key).or_default();
                entry.writer = Some(ticket);
            }
            tickets.insert(ticket, TicketEntry {
                state: snap.state,
                broker: snap.broker,
                held: snap.held,
                waiting: HashSet::new(),
                staged: snap.staged,
                tx_id: snap.tx_id,
                wounded_by: None,
            });
        }
        *inner = Inner {
            keys,
            tickets,
            completed_txs: snapshot.completed_txs.into_iter().collect(),
        };
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum Acquire {
    Granted(Option<Value>),
    Wait(oneshot::Receiver<Result<Option<Value>, ShardError>>),
}

impl Inner {
    fn acquire_or_enqueue(&mut self, ticket: TicketNumber, key: Hash, mode: LockMode) -> Acquire {
        let entry = self.keys.entry(key).or_default();

        // Re-entrant holds.
        if entry.writer == Some(ticket) {
            return Acquire::Granted(entry.value.clone());
        }
        if entry.readers.contains(&ticket) {
            match mode {
                LockMode::Read => return Acquire::Granted(entry.value.clone()),
                LockMode::Write => {
                    // Sole reader upgrades in place.
                    if entry.readers.len() == 1 && entry.writer.is_none() {
                        entry.readers.remove(&ticket);
                        entry.writer = Some(ticket);
                        return Acquire::Granted(entry.value.clone());
                    }
                },
            }
        }

        let conflicting: Vec<TicketNumber> = match mode {
            LockMode::Read => entry.writer.into_iter().collect(),
            LockMode::Write => entry
                .writer
                .into_iter()
                .chain(entry.readers.iter().copied())
                .filter(|holder| *holder != ticket)
                .collect(),
        };

        // Queued older tickets take priority even when the current holders
        // would not conflict, so a stream of young lock requests cannot
        // starve an old one.
        let blocked_by_queue = entry
            .queue
            .front()
            .map(|waiter| waiter.ticket < ticket)
            .unwrap_or(false);

        if conflicting.is_empty() && !blocked_by_queue {
            match mode {
                LockMode::Read => {
                    entry.readers.insert(ticket);
                },
                LockMode::Write => entry.writer = Some(ticket),
            }
            let value = entry.value.clone();
            if let Some(ticket_entry) = self.tickets.get_mut(&ticket) {
                ticket_entry.held.insert(key);
            }
            return Acquire::Granted(value);
        }

        // Wound-wait: the requester always waits, and any conflicting
        // younger holder is wounded so its broker rolls it back.
        let (reply, rx) = oneshot::channel();
        let position = entry
            .queue
            .iter()
            .position(|waiter| waiter.ticket > ticket)
            .unwrap_or(entry.queue.len());
        entry.queue.insert(position, Waiter { ticket, mode, reply });
        if let Some(ticket_entry) = self.tickets.get_mut(&ticket) {
            ticket_entry.waiting.insert(key);
        }

        for holder in conflicting {
            if holder > ticket {
                self.wound(holder, ticket, key);
            }
        }

        Acquire::Wait(rx)
    }

    /// Mark `victim` wounded by `by_ticket` at `by_key` and fail all of its
    /// pending lock requests. Held locks stay until its broker rolls it
    /// back.
    fn wound(&mut self, victim: TicketNumber, by_ticket: TicketNumber, by_key: Hash) {
        let Some(entry) = self.tickets.get_mut(&victim) else {
            return;
        };
        // Only tickets that have not yet prepared can be wounded.
        if !matches!(entry.state, TicketState::Begun) {
            return;
        }
        debug!(
            target: LOG_TARGET,
            "Ticket {} wounded by older ticket {} at key {}",
            victim,
            by_ticket,
            by_key
        );
        entry.state = TicketState::Wounded;
        entry.wounded_by = Some((by_ticket, by_key));
        let waiting: Vec<Hash> = entry.waiting.drain().collect();

        let error = ShardError::Wounded {
            wounding_ticket: by_ticket,
            wounding_key: by_key,
        };
        for key in waiting {
            if let Some(key_entry) = self.keys.get_mut(&key) {
                if let Some(position) = key_entry.queue.iter().position(|w| w.ticket == victim) {
                    if let Some(waiter) = key_entry.queue.remove(position) {
                        let _ = waiter.reply.send(Err(error.clone()));
                    }
                }
            }
        }
    }

    /// Remove a ticket's queued waiters without replying; used by rollback,
    /// where the caller already knows the outcome.
    fn drop_waiters(&mut self, ticket: TicketNumber) {
        let waiting: Vec<Hash> = match self.tickets.get_mut(&ticket) {
            Some(entry) => entry.waiting.drain().collect(),
            None => return,
        };
        for key in waiting {
            if let Some(key_entry) = self.keys.get_mut(&key) {
                key_entry.queue.retain(|waiter| waiter.ticket != ticket);
            }
        }
    }

    /// Release every lock `ticket` holds and grant queued waiters in ticket
    /// order.
    fn release_locks(&mut self, ticket: TicketNumber) {
        let held: Vec<Hash> = match self.tickets.get_mut(&ticket) {
            Some(entry) => std::mem::take(&mut entry.held).into_iter().collect(),
            None => return,
        };
        for key in held {
            if let Some(entry) = self.keys.get_mut(&key) {
                entry.readers.remove(&ticket);
                if entry.writer == Some(ticket) {
                    entry.writer = None;
                }
            }
            self.grant_waiters(key);
            if let Some(entry) = self.keys.get(&key) {
                if entry.is_idle() {
                    self.keys.remove(&key);
                }
            }
        }
    }

    fn grant_waiters(&mut self, key: Hash) {
        loop {
            let grantable = {
                let Some(entry) = self.keys.get(&key) else {
                    return;
                };
                match entry.queue.front() {
                    Some(waiter) => match waiter.mode {
                        // A waiter upgrading its own read lock is grantable
                        // as soon as it is the sole remaining reader.
                        LockMode::Write => {
                            entry.writer.is_none()
                                && entry.readers.iter().all(|reader| *reader == waiter.ticket)
                        },
                        LockMode::Read => entry.writer.is_none(),
                    },
                    None => false,
                }
            };
            if !grantable {
                return;
            }

            let Some(entry) = self.keys.get_mut(&key) else {
                return;
            };
            let Some(waiter) = entry.queue.pop_front() else {
                return;
            };
            match waiter.mode {
                LockMode::Write => {
                    entry.readers.remove(&waiter.ticket);
                    entry.writer = Some(waiter.ticket);
                },
                LockMode::Read => {
                    entry.readers.insert(waiter.ticket);
                },
            }
            let value = entry.value.clone();
            if let Some(ticket_entry) = self.tickets.get_mut(&waiter.ticket) {
                ticket_entry.waiting.remove(&key);
                ticket_entry.held.insert(key);
            }
            let _ = waiter.reply.send(Ok(value));
        }
    }
}
