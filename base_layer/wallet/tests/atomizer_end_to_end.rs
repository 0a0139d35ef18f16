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

//! End-to-end client flows over the atomizer architecture, wired
//! in-process: client → sentinel → shards → atomizer → watchtower.

mod support;

use std::{sync::Arc, time::Duration};

use cbdc_common::ShardRange;
use cbdc_common_types::{new_keypair, sign_hash, Hash};
use cbdc_core::{
    sentinel::{Sentinel, SentinelBackend, ShardNotifier, TxStatus},
    transactions::{
        witness_commitment,
        CompactTransaction,
        FullTransaction,
        Input,
        OutPoint,
        Output,
        P2PK_WITNESS_TYPE,
    },
    watchtower::{SearchStatus, StatusUpdateRequest},
};
use cbdc_wallet::{Client, MintAuthority, MintSubmitter, SyncBackend, Wallet, WatchtowerClient};
use support::{sentinel_keys, AtomizerNet, InProcessSentinel, SentinelKeys};

const ABANDON_INTERVAL: Duration = Duration::from_secs(3600);
const STXO_CACHE_DEPTH: usize = 2;

struct AtomizerSystem {
    net: Arc<AtomizerNet>,
    sentinel: Arc<Sentinel>,
    keys: SentinelKeys,
}

impl AtomizerSystem {
    fn new() -> Self {
        let keys = sentinel_keys(1);
        let net = AtomizerNet::new(STXO_CACHE_DEPTH);
        let shards: Vec<(ShardRange, Arc<dyn ShardNotifier>)> = vec![
            (ShardRange::new(0, 127), net.clone()),
            (ShardRange::new(128, 255), net.clone()),
        ];
        let sentinel = Arc::new(Sentinel::new(
            keys.secrets[0],
            keys.publics.clone(),
            1,
            vec![],
            SentinelBackend::Atomizer {
                shards,
                atomizer: net.clone(),
            },
        ));
        Self { net, sentinel, keys }
    }

    fn client(&self) -> Client {
        Client::new(
            Wallet::new(),
            Arc::new(InProcessSentinel {
                sentinel: self.sentinel.clone(),
            }),
            SyncBackend::Atomizer(self.net.clone()),
            ABANDON_INTERVAL,
        )
        .with_mint_authority(MintAuthority {
            sentinel_secrets: self.keys.secrets.clone(),
            submitter: MintSubmitter::Atomizer(self.net.clone()),
        })
    }

    async fn uhs_status(&self, tx_id: Hash, uhs_id: Hash) -> SearchStatus {
        let mut request = StatusUpdateRequest::default();
        request.uhs_ids.insert(tx_id, vec![uhs_id]);
        let response = self.net.status_update(request).await.unwrap();
        response.states[&tx_id][0].status
    }
}

/// A statically valid transaction spending an out-point the shards have
/// never heard of.
fn fabricated_tx() -> FullTransaction {
    let secp = secp256k1::Secp256k1::new();
    let (secret, public) = new_keypair(&secp, &mut rand::thread_rng());
    let commitment = witness_commitment(&public);
    let mut tx = FullTransaction {
        inputs: vec![Input::new(
            OutPoint::new(Hash::digest(b"fabricated"), 0),
            Output::new(commitment, 100),
        )],
        outputs: vec![Output::new(commitment, 100)],
        witnesses: vec![],
    };
    let tx_id = tx.tx_id();
    let signature = sign_hash(&secp, &secret, &tx_id);
    let mut witness = vec![P2PK_WITNESS_TYPE];
    witness.extend_from_slice(&public.serialize());
    witness.extend_from_slice(&signature[..]);
    tx.witnesses = vec![witness];
    tx
}

#[tokio::test]
async fn transfer_settles_through_block_cut() {
    let system = AtomizerSystem::new();
    let alice = system.client();
    let bob = system.client();

    // Mint is accepted immediately but only settles with a block cut.
    alice.mint(4, 25).await.unwrap().expect("mint accepted");
    assert_eq!(alice.balance().await, 0);
    system.net.cut_block();
    assert!(alice.sync().await);
    assert_eq!(alice.balance().await, 100);

    // Alice pays Bob 33; the transfer is pending until the next cut.
    let bob_address = bob.new_address().await;
    let (tx, response) = alice.send(33, &bob_address).await.unwrap();
    assert_eq!(response.unwrap().status, TxStatus::Pending);
    assert_eq!(alice.pending_tx_count().await, 1);

    for input in Wallet::export_send_inputs(&tx, &bob_address) {
        bob.import_send_input(input).await;
    }

    let block = system.net.cut_block();
    assert_eq!(block.transactions.len(), 1);

    assert!(alice.sync().await);
    assert!(bob.sync().await);
    assert_eq!(alice.balance().await, 67);
    assert_eq!(bob.balance().await, 33);
    assert_eq!(alice.pending_tx_count().await, 0);
    assert_eq!(bob.pending_input_count().await, 0);
}

#[tokio::test]
async fn watchtower_tracks_block_height() {
    let system = AtomizerSystem::new();
    assert_eq!(system.net.best_block_height().await, Some(0));
    system.net.cut_block();
    system.net.cut_block();
    assert_eq!(system.net.best_block_height().await, Some(2));
}

#[tokio::test]
async fn double_spend_within_attestation_window() {
    let system = AtomizerSystem::new();
    let alice = system.client();
    let bob = system.client();
    let eve = system.client();

    alice.mint(1, 100).await.unwrap().expect("mint accepted");
    system.net.cut_block();
    assert!(alice.sync().await);

    // Two transactions consuming the same output are attested before the
    // next block cut.
    let bob_address = bob.new_address().await;
    let (first, response) = alice.send(100, &bob_address).await.unwrap();
    assert_eq!(response.unwrap().status, TxStatus::Pending);

    let conflicting = {
        let mut tx = first.clone();
        let eve_address = eve.new_address().await;
        tx.outputs[0] = Output::new(witness_commitment(&eve_address), 100);
        tx
    };
    assert_ne!(conflicting.tx_id(), first.tx_id());
    let conflicting_compact = CompactTransaction::from_full(&conflicting);

    // The shard still sees the input unspent and attests, but the atomizer
    // has already spent it in its window and rejects the conflict.
    assert!(!system.net.submit(&conflicting_compact));

    system.net.cut_block();
    assert!(alice.sync().await);
    assert_eq!(alice.balance().await, 0);

    // Exactly one of the two settled: the first transaction's output is
    // unspent, the conflict is reported against the shared input.
    let first_compact = CompactTransaction::from_full(&first);
    assert_eq!(
        system.uhs_status(first_compact.tx_id, first_compact.outputs[0]).await,
        SearchStatus::Unspent
    );
    assert_eq!(
        system
            .uhs_status(conflicting_compact.tx_id, conflicting_compact.inputs[0])
            .await,
        SearchStatus::InvalidInput
    );
}

#[tokio::test]
async fn mint_and_transfer_settle_in_the_same_block() {
    let system = AtomizerSystem::new();
    let alice = system.client();
    let bob = system.client();

    alice.mint(1, 100).await.unwrap().expect("mint accepted");
    system.net.cut_block();
    assert!(alice.sync().await);

    // A second mint and a transfer are both pending, then settle together.
    alice.mint(1, 50).await.unwrap().expect("mint accepted");
    let bob_address = bob.new_address().await;
    let (_, response) = alice.send(80, &bob_address).await.unwrap();
    assert_eq!(response.unwrap().status, TxStatus::Pending);

    let block = system.net.cut_block();
    assert_eq!(block.transactions.len(), 2);

    assert!(alice.sync().await);
    // 100 − 80 change plus the fresh 50.
    assert_eq!(alice.balance().await, 70);
}

#[tokio::test]
async fn shards_reject_unknown_inputs() {
    let system = AtomizerSystem::new();
    let tx = fabricated_tx();

    // Statically valid, so the sentinel forwards it; the shard reports the
    // inputs as nonexistent and nothing settles.
    let response = system.sentinel.execute(tx.clone()).await;
    assert_eq!(response.status, TxStatus::StateInvalid);

    let compact = CompactTransaction::from_full(&tx);
    assert_eq!(
        system.uhs_status(compact.tx_id, compact.inputs[0]).await,
        SearchStatus::InvalidInput
    );
}
