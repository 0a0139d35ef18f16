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

//! End-to-end client flows over the two-phase-commit architecture, wired
//! in-process: client → sentinel → coordinator → locking shards.

mod support;

use std::{sync::Arc, time::Duration};

use cbdc_common::ShardRange;
use cbdc_core::{
    coordinator::Coordinator,
    locking_shard::{LockingShard, LockingShardClient, ReplicatedLockingShard},
    sentinel::{Sentinel, SentinelBackend, TxStatus},
    transactions::{validate_transaction, CompactTransaction, TxValidationError},
};
use cbdc_wallet::{Client, MintAuthority, MintSubmitter, SyncBackend, Wallet};
use secp256k1::Secp256k1;
use support::{sentinel_keys, InProcessCoordinator, InProcessSentinel, InProcessShardStatus, SentinelKeys};

const ABANDON_INTERVAL: Duration = Duration::from_secs(3600);

struct TwoPhaseSystem {
    shards: Vec<Arc<ReplicatedLockingShard>>,
    coordinator_client: Arc<InProcessCoordinator>,
    sentinel: Arc<Sentinel>,
    keys: SentinelKeys,
}

impl TwoPhaseSystem {
    fn new() -> Self {
        let keys = sentinel_keys(1);
        let ranges = vec![ShardRange::new(0, 127), ShardRange::new(128, 255)];
        let shards: Vec<Arc<ReplicatedLockingShard>> = ranges
            .iter()
            .map(|range| Arc::new(ReplicatedLockingShard::new(Arc::new(LockingShard::new(*range)))))
            .collect();

        let coordinator = Arc::new(Coordinator::new(
            shards
                .iter()
                .map(|shard| shard.clone() as Arc<dyn LockingShardClient>)
                .collect(),
            ranges,
            0,
            keys.publics.clone(),
            1,
            Duration::from_secs(1),
        ));
        let coordinator_client = InProcessCoordinator::new(coordinator);

        let sentinel = Arc::new(Sentinel::new(
            keys.secrets[0],
            keys.publics.clone(),
            1,
            vec![],
            SentinelBackend::TwoPhase {
                coordinator: coordinator_client.clone(),
            },
        ));

        Self {
            shards,
            coordinator_client,
            sentinel,
            keys,
        }
    }

    fn client(&self) -> Client {
        Client::new(
            Wallet::new(),
            Arc::new(InProcessSentinel {
                sentinel: self.sentinel.clone(),
            }),
            SyncBackend::TwoPhase(Arc::new(InProcessShardStatus {
                shards: self.shards.clone(),
            })),
            ABANDON_INTERVAL,
        )
        .with_mint_authority(MintAuthority {
            sentinel_secrets: self.keys.secrets.clone(),
            submitter: MintSubmitter::Coordinator(self.coordinator_client.clone()),
        })
    }

    fn client_with_wallet(&self, wallet: Wallet) -> Client {
        Client::new(
            wallet,
            Arc::new(InProcessSentinel {
                sentinel: self.sentinel.clone(),
            }),
            SyncBackend::TwoPhase(Arc::new(InProcessShardStatus {
                shards: self.shards.clone(),
            })),
            ABANDON_INTERVAL,
        )
    }
}

#[tokio::test]
async fn simple_transfer() {
    let system = TwoPhaseSystem::new();
    let alice = system.client();
    let bob = system.client();

    // Genesis: seed Alice with 100 across 4 outputs.
    alice.mint(4, 25).await.unwrap().expect("mint accepted");
    assert_eq!(alice.balance().await, 100);
    assert_eq!(alice.utxo_count().await, 4);

    // Alice pays Bob 33; settlement is synchronous in 2PC.
    let bob_address = bob.new_address().await;
    let (tx, response) = alice.send(33, &bob_address).await.unwrap();
    assert_eq!(response.unwrap().status, TxStatus::Confirmed);
    assert_eq!(alice.balance().await, 67);

    // Bob receives the exported inputs and confirms via the shard
    // read-only endpoint.
    for input in Wallet::export_send_inputs(&tx, &bob_address) {
        bob.import_send_input(input).await;
    }
    assert!(bob.sync().await);
    assert_eq!(bob.balance().await, 33);

    // The minted outputs consumed by the transfer are spent on the shards;
    // the new outputs exist.
    let compact = CompactTransaction::from_full(&tx);
    for input in &compact.inputs {
        assert!(!system.shards.iter().any(|s| s.check_unspent(input)));
    }
    for output in &compact.outputs {
        assert!(system.shards.iter().any(|s| s.check_unspent(output)));
    }
}

#[tokio::test]
async fn duplicate_submission_is_state_invalid() {
    let system = TwoPhaseSystem::new();
    let alice = system.client();
    let bob = system.client();

    alice.mint(4, 25).await.unwrap().expect("mint accepted");
    let bob_address = bob.new_address().await;
    let (tx, response) = alice.send(33, &bob_address).await.unwrap();
    assert_eq!(response.unwrap().status, TxStatus::Confirmed);
    assert_eq!(alice.balance().await, 67);

    // Submitting the identical full transaction again: the inputs are
    // already spent.
    let response = system.sentinel.execute(tx).await;
    assert_eq!(response.status, TxStatus::StateInvalid);
    assert_eq!(alice.balance().await, 67);
}

#[tokio::test]
async fn double_spend_across_transactions_is_rejected() {
    let system = TwoPhaseSystem::new();
    let alice = system.client();
    let bob = system.client();

    alice.mint(1, 100).await.unwrap().expect("mint accepted");
    let bob_address = bob.new_address().await;
    let (spent_tx, response) = alice.send(100, &bob_address).await.unwrap();
    assert_eq!(response.unwrap().status, TxStatus::Confirmed);
    assert_eq!(alice.balance().await, 0);

    // A conflicting transaction reusing the already-spent out-point, with a
    // matching witness, is statically fine but rejected by settlement.
    let secp = Secp256k1::new();
    let conflicting = spent_tx.clone();
    validate_transaction(&secp, &conflicting).unwrap();
    let response = system.sentinel.execute(conflicting.clone()).await;
    assert_eq!(response.status, TxStatus::StateInvalid);

    // No shard state changed: Bob's outputs are still the unspent set.
    let compact = CompactTransaction::from_full(&spent_tx);
    for output in &compact.outputs {
        assert!(system.shards.iter().any(|s| s.check_unspent(output)));
    }
}

#[tokio::test]
async fn rejected_send_is_abandoned_and_balance_restored() {
    let system = TwoPhaseSystem::new();
    let dir = tempfile::tempdir().unwrap();
    let wallet_path = dir.path().join("alice.dat");

    let alice = system
        .client_with_wallet(Wallet::load_or_create(&wallet_path).unwrap())
        .with_wallet_file(&wallet_path)
        .with_mint_authority(MintAuthority {
            sentinel_secrets: system.keys.secrets.clone(),
            submitter: MintSubmitter::Coordinator(system.coordinator_client.clone()),
        });
    let bob = system.client();
    let bob_address = bob.new_address().await;

    alice.mint(2, 50).await.unwrap().expect("mint accepted");

    // Snapshot the funded wallet, then spend everything from the live one.
    let stale_wallet = Wallet::load_or_create(&wallet_path).unwrap();
    let (_, response) = alice.send(60, &bob_address).await.unwrap();
    assert_eq!(response.unwrap().status, TxStatus::Confirmed);

    // The stale copy still believes it holds the spent outputs. Its send is
    // rejected by settlement and auto-abandoned, restoring the reserved
    // outputs to its local spendable set with no shard state change.
    let stale = system.client_with_wallet(stale_wallet);
    assert_eq!(stale.balance().await, 100);
    let (_, response) = stale.send(100, &bob_address).await.unwrap();
    assert_eq!(response.unwrap().status, TxStatus::StateInvalid);
    assert_eq!(stale.balance().await, 100);
    assert_eq!(stale.pending_tx_count().await, 0);
}

#[tokio::test]
async fn static_invalidity_never_reaches_the_coordinator() {
    let system = TwoPhaseSystem::new();
    let alice = system.client();

    alice.mint(1, 100).await.unwrap().expect("mint accepted");
    let calls_after_mint = system.coordinator_client.call_count();

    // Hand-build an unbalanced transaction from the minted output.
    let mut wallet = Wallet::new();
    let address = wallet.new_address();
    let mut tx = {
        // Reuse the client wallet's machinery indirectly: craft from
        // scratch with an unbalanced output set.
        use cbdc_core::transactions::{Input, OutPoint, Output};
        cbdc_core::transactions::FullTransaction {
            inputs: vec![Input::new(
                OutPoint::new(cbdc_common_types::Hash::digest(b"genesis"), 0),
                Output::new(cbdc_core::transactions::witness_commitment(&address), 100),
            )],
            outputs: vec![Output::new(
                cbdc_core::transactions::witness_commitment(&address),
                1,
            )],
            witnesses: vec![vec![]],
        }
    };
    tx.witnesses = vec![vec![0u8; cbdc_core::transactions::P2PK_WITNESS_LEN]];

    let response = system.sentinel.execute(tx).await;
    assert_eq!(response.status, TxStatus::StaticInvalid);
    assert_eq!(response.error, Some(TxValidationError::AsymmetricValues));
    // Nothing was sent downstream, so no ticket was issued.
    assert_eq!(system.coordinator_client.call_count(), calls_after_mint);
}
