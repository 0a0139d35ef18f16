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

//! In-process wiring of the settlement components for end-to-end client
//! tests: no sockets, real protocol logic.

// Each test binary uses its own subset of this module.
#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};

use async_trait::async_trait;
use cbdc_common::ShardRange;
use cbdc_common_types::{PublicKey, SecretKey, Signature};
use cbdc_core::{
    atomizer::{Atomizer, Block, TxNotification},
    coordinator::{Coordinator, CoordinatorClient},
    sentinel::{AtomizerNotifier, ExecuteResponse, Sentinel, SentinelPeer, ShardNotifier},
    shard::{BlockResult, Shard},
    transactions::{CompactTransaction, FullTransaction},
    watchtower::{StatusUpdateRequest, StatusUpdateResponse, Watchtower},
};
use cbdc_wallet::{SentinelClient, ShardStatusClient, WatchtowerClient};
use cbdc_core::locking_shard::ReplicatedLockingShard;

/// Coordinator reachable in-process, counting calls so tests can assert
/// nothing was forwarded.
pub struct InProcessCoordinator {
    pub coordinator: Arc<Coordinator>,
    pub calls: AtomicUsize,
}

impl InProcessCoordinator {
    pub fn new(coordinator: Arc<Coordinator>) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CoordinatorClient for InProcessCoordinator {
    async fn execute(&self, tx: CompactTransaction) -> Option<bool> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.coordinator.execute(&tx).await {
            Ok(committed) => Some(committed),
            Err(_) => None,
        }
    }
}

/// Sentinel reachable in-process.
pub struct InProcessSentinel {
    pub sentinel: Arc<Sentinel>,
}

#[async_trait]
impl SentinelClient for InProcessSentinel {
    async fn execute(&self, tx: FullTransaction) -> Option<ExecuteResponse> {
        Some(self.sentinel.execute(tx).await)
    }
}

#[async_trait]
impl SentinelPeer for InProcessSentinel {
    async fn validate(&self, tx: FullTransaction) -> Option<(PublicKey, Signature)> {
        self.sentinel.validate(&tx)
    }
}

/// Read-only status oracle over a set of in-process locking shards.
pub struct InProcessShardStatus {
    pub shards: Vec<Arc<ReplicatedLockingShard>>,
}

#[async_trait]
impl ShardStatusClient for InProcessShardStatus {
    async fn check_tx_id(&self, tx_id: cbdc_common_types::Hash) -> Option<bool> {
        Some(self.shards.iter().any(|shard| shard.check_tx_id(&tx_id)))
    }

    async fn check_unspent(&self, uhs_id: cbdc_common_types::Hash) -> Option<bool> {
        Some(self.shards.iter().any(|shard| shard.check_unspent(&uhs_id)))
    }
}

/// The atomizer architecture wired together in one process: shards attest,
/// the atomizer orders, the watchtower indexes blocks and errors. Blocks
/// are cut on demand by the test.
pub struct AtomizerNet {
    pub shards: Mutex<Vec<Shard>>,
    pub atomizer: Mutex<Atomizer>,
    pub watchtower: Mutex<Watchtower>,
}

impl AtomizerNet {
    pub fn new(stxo_cache_depth: usize) -> Arc<Self> {
        let ranges = [ShardRange::new(0, 127), ShardRange::new(128, 255)];
        Arc::new(Self {
            shards: Mutex::new(ranges.iter().map(|range| Shard::new(*range)).collect()),
            atomizer: Mutex::new(Atomizer::new(0, stxo_cache_depth)),
            watchtower: Mutex::new(Watchtower::new(100, 100)),
        })
    }

    /// Route a compact transaction to every shard, collecting attestations
    /// into the atomizer exactly as the daemons would.
    pub fn submit(&self, tx: &CompactTransaction) -> bool {
        let notifications: Vec<TxNotification> = {
            let shards = self.shards.lock().unwrap();
            let mut notifications = Vec::new();
            for shard in shards.iter() {
                match shard.digest_transaction(tx) {
                    Ok(Some(notification)) => notifications.push(notification),
                    Ok(None) => {},
                    Err(error) => {
                        self.watchtower.lock().unwrap().add_errors(vec![error]);
                        return false;
                    },
                }
            }
            notifications
        };

        let mut atomizer = self.atomizer.lock().unwrap();
        let mut delivered = false;
        for notification in notifications {
            let attested: HashSet<u64> = notification.attested_inputs.into_iter().collect();
            match atomizer.insert(notification.block_height, notification.tx, attested) {
                Ok(()) => delivered = true,
                Err(error) => {
                    self.watchtower.lock().unwrap().add_errors(vec![error]);
                },
            }
        }
        delivered
    }

    /// Cut a block and distribute it to the shards and the watchtower.
    pub fn cut_block(&self) -> Block {
        let (block, errors) = self.atomizer.lock().unwrap().make_block();
        {
            let mut shards = self.shards.lock().unwrap();
            for shard in shards.iter_mut() {
                assert_ne!(
                    shard.digest_block(&block),
                    BlockResult::Stale,
                    "shards must apply blocks in order"
                );
            }
        }
        let mut watchtower = self.watchtower.lock().unwrap();
        watchtower.add_block(block.clone());
        watchtower.add_errors(errors);
        block
    }

    pub fn seed(&self, uhs_ids: &[cbdc_common_types::Hash]) {
        let mut shards = self.shards.lock().unwrap();
        for shard in shards.iter_mut() {
            shard.seed(uhs_ids.iter().copied());
        }
    }
}

#[async_trait]
impl ShardNotifier for AtomizerNet {
    async fn send_transaction(&self, tx: CompactTransaction) -> bool {
        self.submit(&tx)
    }
}

#[async_trait]
impl AtomizerNotifier for AtomizerNet {
    async fn insert_complete(&self, tx: CompactTransaction) -> bool {
        let result = self.atomizer.lock().unwrap().insert_complete(0, tx);
        match result {
            Ok(()) => true,
            Err(error) => {
                self.watchtower.lock().unwrap().add_errors(vec![error]);
                false
            },
        }
    }
}

#[async_trait]
impl WatchtowerClient for AtomizerNet {
    async fn status_update(&self, request: StatusUpdateRequest) -> Option<StatusUpdateResponse> {
        Some(self.watchtower.lock().unwrap().handle_status_update(&request))
    }

    async fn best_block_height(&self) -> Option<u64> {
        Some(self.watchtower.lock().unwrap().best_block_height())
    }
}

/// A sentinel keypair set shared by a test deployment.
pub struct SentinelKeys {
    pub secrets: Vec<SecretKey>,
    pub publics: Vec<PublicKey>,
}

pub fn sentinel_keys(n: usize) -> SentinelKeys {
    let secp = secp256k1::Secp256k1::new();
    let mut secrets = Vec::new();
    let mut publics = Vec::new();
    for _ in 0..n {
        let (secret, public) = cbdc_common_types::new_keypair(&secp, &mut rand::thread_rng());
        secrets.push(secret);
        publics.push(public);
    }
    SentinelKeys { secrets, publics }
}
