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

//! Stateless validation front-end: statically validates client
//! transactions, gathers a quorum of peer sentinel attestations over the
//! transaction id, and forwards the compact form downstream: to the shards
//! in the atomizer architecture, to the coordinator in two-phase-commit.

use std::sync::Arc;

use cbdc_common::ShardRange;
use cbdc_common_types::{sign_hash, verify_hash, PublicKey, SecretKey, Signature};
use log::*;
use rand::seq::SliceRandom;
use secp256k1::{All, Secp256k1};

use crate::{
    atomizer::AtomizerRequest,
    codec::{CodecError, Decode, Encode, Reader},
    coordinator::CoordinatorClient,
    network::RpcClient,
    transactions::{validate_transaction, CompactTransaction, FullTransaction, TxValidationError},
};

use async_trait::async_trait;

const LOG_TARGET: &str = "c::sentinel";

/// Attempts to get a decision out of the coordinator before giving up.
const COORDINATOR_RETRIES: usize = 3;

/// Outcome of submitting a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Statically invalid; terminal.
    StaticInvalid,
    /// Valid and forwarded; confirmation must be polled for.
    Pending,
    /// Settled.
    Confirmed,
    /// The settlement layer rejected the transaction (spent or missing
    /// inputs, lost conflict, or lost quorum).
    StateInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteResponse {
    pub status: TxStatus,
    pub error: Option<TxValidationError>,
}

impl ExecuteResponse {
    fn status(status: TxStatus) -> Self {
        Self { status, error: None }
    }
}

/// Peer sentinel reachable for attestation requests.
#[async_trait]
pub trait SentinelPeer: Send + Sync {
    async fn validate(&self, tx: FullTransaction) -> Option<(PublicKey, Signature)>;
}

/// Shard notification sink for the atomizer architecture.
#[async_trait]
pub trait ShardNotifier: Send + Sync {
    /// Deliver a compact transaction; returns whether delivery succeeded.
    async fn send_transaction(&self, tx: CompactTransaction) -> bool;
}

/// Direct atomizer path for transactions with nothing for shards to attest.
#[async_trait]
pub trait AtomizerNotifier: Send + Sync {
    async fn insert_complete(&self, tx: CompactTransaction) -> bool;
}

/// Where validated transactions go.
pub enum SentinelBackend {
    Atomizer {
        shards: Vec<(ShardRange, Arc<dyn ShardNotifier>)>,
        atomizer: Arc<dyn AtomizerNotifier>,
    },
    TwoPhase {
        coordinator: Arc<dyn CoordinatorClient>,
    },
}

pub struct Sentinel {
    secp: Secp256k1<All>,
    signing_key: SecretKey,
    /// Public keys of every configured sentinel, this one included.
    known_keys: Vec<PublicKey>,
    attestation_threshold: usize,
    peers: Vec<Arc<dyn SentinelPeer>>,
    backend: SentinelBackend,
}

impl Sentinel {
    pub fn new(
        signing_key: SecretKey,
        known_keys: Vec<PublicKey>,
        attestation_threshold: usize,
        peers: Vec<Arc<dyn SentinelPeer>>,
        backend: SentinelBackend,
    ) -> Self {
        Self {
            secp: Secp256k1::new(),
            signing_key,
            known_keys,
            attestation_threshold,
            peers,
            backend,
        }
    }

    /// Validate, attest, gather quorum and forward. Static errors are
    /// terminal and echoed back verbatim.
    pub async fn execute(&self, tx: FullTransaction) -> ExecuteResponse {
        if let Err(error) = validate_transaction(&self.secp, &tx) {
            debug!(target: LOG_TARGET, "Rejected tx {}: {}", tx.tx_id(), error);
            return ExecuteResponse {
                status: TxStatus::StaticInvalid,
                error: Some(error),
            };
        }

        let mut compact = CompactTransaction::from_full(&tx);
        compact.attest(&self.secp, &self.signing_key);

        if !self.gather_attestations(&tx, &mut compact).await {
            warn!(
                target: LOG_TARGET,
                "Could not reach attestation quorum for tx {}", compact.tx_id
            );
            return ExecuteResponse::status(TxStatus::StateInvalid);
        }

        debug!(target: LOG_TARGET, "Accepted tx {}", compact.tx_id);
        self.forward(compact).await
    }

    /// Statically validate and, if valid, return a fresh attestation under
    /// this sentinel's key.
    pub fn validate(&self, tx: &FullTransaction) -> Option<(PublicKey, Signature)> {
        if validate_transaction(&self.secp, tx).is_err() {
            return None;
        }
        let tx_id = tx.tx_id();
        let public_key = cbdc_common_types::public_key_from_secret(&self.secp, &self.signing_key);
        Some((public_key, sign_hash(&self.secp, &self.signing_key, &tx_id)))
    }

    /// Request attestations from peers chosen uniformly at random without
    /// replacement until the threshold is met or every peer was tried.
    /// Responses are verified individually; only the quorum is trusted.
    async fn gather_attestations(&self, tx: &FullTransaction, compact: &mut CompactTransaction) -> bool {
        let mut order: Vec<usize> = (0..self.peers.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        for peer_idx in order {
            if compact.sufficiently_attested(&self.secp, &self.known_keys, self.attestation_threshold) {
                return true;
            }
            if let Some((public_key, signature)) = self.peers[peer_idx].validate(tx.clone()).await {
                if !self.known_keys.contains(&public_key) {
                    debug!(target: LOG_TARGET, "Ignoring attestation from unknown key");
                    continue;
                }
                if !verify_hash(&self.secp, &public_key, &compact.tx_id, &signature) {
                    debug!(target: LOG_TARGET, "Ignoring attestation with bad signature");
                    continue;
                }
                compact.insert_attestation(public_key, signature);
            }
        }
        compact.sufficiently_attested(&self.secp, &self.known_keys, self.attestation_threshold)
    }

    async fn forward(&self, compact: CompactTransaction) -> ExecuteResponse {
        match &self.backend {
            SentinelBackend::Atomizer { shards, atomizer } => {
                if compact.inputs.is_empty() {
                    // Nothing for shards to attest; hand the transaction to
                    // the atomizer directly on the strength of the quorum.
                    if atomizer.insert_complete(compact).await {
                        return ExecuteResponse::status(TxStatus::Pending);
                    }
                    return ExecuteResponse::status(TxStatus::StateInvalid);
                }
                self.fan_to_shards(shards, compact).await
            },
            SentinelBackend::TwoPhase { coordinator } => {
                for _ in 0..COORDINATOR_RETRIES {
                    match coordinator.execute(compact.clone()).await {
                        Some(true) => return ExecuteResponse::status(TxStatus::Confirmed),
                        Some(false) => return ExecuteResponse::status(TxStatus::StateInvalid),
                        None => {
                            debug!(
                                target: LOG_TARGET,
                                "No coordinator decision for tx {}; retrying", compact.tx_id
                            );
                        },
                    }
                }
                ExecuteResponse::status(TxStatus::StateInvalid)
            },
        }
    }

    /// Send the compact transaction to every shard whose range covers one of
    /// its inputs, stopping once every input is covered.
    async fn fan_to_shards(
        &self,
        shards: &[(ShardRange, Arc<dyn ShardNotifier>)],
        compact: CompactTransaction,
    ) -> ExecuteResponse {
        let mut inputs_sent = vec![false; compact.inputs.len()];
        let mut delivered = false;

        for (range, notifier) in shards {
            if inputs_sent.iter().all(|sent| *sent) {
                break;
            }
            let mut should_send = false;
            for (idx, input) in compact.inputs.iter().enumerate() {
                if !inputs_sent[idx] && range.contains(input) {
                    inputs_sent[idx] = true;
                    should_send = true;
                }
            }
            if should_send && notifier.send_transaction(compact.clone()).await {
                delivered = true;
            }
        }

        if delivered {
            ExecuteResponse::status(TxStatus::Pending)
        } else {
            warn!(
                target: LOG_TARGET,
                "Failed to deliver tx {} to any shard", compact.tx_id
            );
            ExecuteResponse::status(TxStatus::StateInvalid)
        }
    }
}

/// Wire requests served by the sentinel endpoint. `Execute` comes from
/// clients, `Validate` from peer sentinels gathering attestations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelRequest {
    Execute(FullTransaction),
    Validate(FullTransaction),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SentinelResponse {
    Execute(ExecuteResponse),
    Validate(Option<(PublicKey, Signature)>),
}

impl Encode for TxStatus {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(match self {
            TxStatus::StaticInvalid => 0,
            TxStatus::Pending => 1,
            TxStatus::Confirmed => 2,
            TxStatus::StateInvalid => 3,
        });
    }
}

impl Decode for TxStatus {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(TxStatus::StaticInvalid),
            1 => Ok(TxStatus::Pending),
            2 => Ok(TxStatus::Confirmed),
            3 => Ok(TxStatus::StateInvalid),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "TxStatus",
            }),
        }
    }
}

impl Encode for ExecuteResponse {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.status.encode_into(buf);
        self.error.encode_into(buf);
    }
}

impl Decode for ExecuteResponse {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            status: TxStatus::decode_from(reader)?,
            error: Option::decode_from(reader)?,
        })
    }
}

impl Encode for SentinelRequest {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            SentinelRequest::Execute(tx) => {
                buf.push(0);
                tx.encode_into(buf);
            },
            SentinelRequest::Validate(tx) => {
                buf.push(1);
                tx.encode_into(buf);
            },
        }
    }
}

impl Decode for SentinelRequest {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(SentinelRequest::Execute(FullTransaction::decode_from(reader)?)),
            1 => Ok(SentinelRequest::Validate(FullTransaction::decode_from(reader)?)),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "SentinelRequest",
            }),
        }
    }
}

impl Encode for SentinelResponse {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            SentinelResponse::Execute(response) => {
                buf.push(0);
                response.encode_into(buf);
            },
            SentinelResponse::Validate(attestation) => {
                buf.push(1);
                attestation.encode_into(buf);
            },
        }
    }
}

impl Decode for SentinelResponse {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(SentinelResponse::Execute(ExecuteResponse::decode_from(reader)?)),
            1 => Ok(SentinelResponse::Validate(Option::decode_from(reader)?)),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "SentinelResponse",
            }),
        }
    }
}

/// RPC-backed peer sentinel.
pub struct RemoteSentinelPeer {
    client: RpcClient<SentinelRequest, SentinelResponse>,
}

impl RemoteSentinelPeer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: RpcClient::new(endpoint),
        }
    }
}

#[async_trait]
impl SentinelPeer for RemoteSentinelPeer {
    async fn validate(&self, tx: FullTransaction) -> Option<(PublicKey, Signature)> {
        match self.client.call(&SentinelRequest::Validate(tx)).await {
            Ok(SentinelResponse::Validate(attestation)) => attestation,
            _ => None,
        }
    }
}

/// RPC-backed shard notification sink (atomizer architecture).
pub struct RemoteShardNotifier {
    client: RpcClient<CompactTransaction, ()>,
}

impl RemoteShardNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: RpcClient::new(endpoint),
        }
    }
}

#[async_trait]
impl ShardNotifier for RemoteShardNotifier {
    async fn send_transaction(&self, tx: CompactTransaction) -> bool {
        self.client.call(&tx).await.is_ok()
    }
}

/// RPC-backed atomizer notification sink.
pub struct RemoteAtomizerNotifier {
    client: RpcClient<AtomizerRequest, ()>,
}

impl RemoteAtomizerNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: RpcClient::new(endpoint),
        }
    }
}

#[async_trait]
impl AtomizerNotifier for RemoteAtomizerNotifier {
    async fn insert_complete(&self, tx: CompactTransaction) -> bool {
        self.client
            .call(&AtomizerRequest::InsertComplete {
                oldest_attestation_height: 0,
                tx,
            })
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use cbdc_common_types::{new_keypair, Hash};

    use super::*;
    use crate::transactions::{witness_commitment, Input, OutPoint, Output, P2PK_WITNESS_TYPE};

    struct LocalPeer {
        sentinel: Sentinel,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SentinelPeer for LocalPeer {
        async fn validate(&self, tx: FullTransaction) -> Option<(PublicKey, Signature)> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.sentinel.validate(&tx)
        }
    }

    struct RecordingCoordinator {
        decision: Option<bool>,
        seen: Mutex<Vec<CompactTransaction>>,
    }

    #[async_trait]
    impl CoordinatorClient for RecordingCoordinator {
        async fn execute(&self, tx: CompactTransaction) -> Option<bool> {
            self.seen.lock().unwrap().push(tx);
            self.decision
        }
    }

    struct Keys {
        secrets: Vec<SecretKey>,
        publics: Vec<PublicKey>,
    }

    fn keys(n: usize) -> Keys {
        let secp = Secp256k1::new();
        let mut secrets = Vec::new();
        let mut publics = Vec::new();
        for _ in 0..n {
            let (secret, public) = new_keypair(&secp, &mut rand::thread_rng());
            secrets.push(secret);
            publics.push(public);
        }
        Keys { secrets, publics }
    }

    fn two_phase_backend(decision: Option<bool>) -> (SentinelBackend, Arc<RecordingCoordinator>) {
        let coordinator = Arc::new(RecordingCoordinator {
            decision,
            seen: Mutex::new(Vec::new()),
        });
        (
            SentinelBackend::TwoPhase {
                coordinator: coordinator.clone(),
            },
            coordinator,
        )
    }

    fn spendable_tx(secp: &Secp256k1<All>) -> FullTransaction {
        let (owner_secret, owner_public) = new_keypair(secp, &mut rand::thread_rng());
        let commitment = witness_commitment(&owner_public);
        let mut tx = FullTransaction {
            inputs: vec![Input::new(
                OutPoint::new(Hash::digest(b"genesis"), 0),
                Output::new(commitment, 10),
            )],
            outputs: vec![Output::new(commitment, 10)],
            witnesses: vec![],
        };
        let tx_id = tx.tx_id();
        let signature = sign_hash(secp, &owner_secret, &tx_id);
        let mut witness = vec![P2PK_WITNESS_TYPE];
        witness.extend_from_slice(&owner_public.serialize());
        witness.extend_from_slice(&signature[..]);
        tx.witnesses = vec![witness];
        tx
    }

    fn peer(signing_key: SecretKey, known: Vec<PublicKey>, threshold: usize) -> Arc<LocalPeer> {
        let (backend, _) = two_phase_backend(Some(true));
        Arc::new(LocalPeer {
            sentinel: Sentinel::new(signing_key, known, threshold, vec![], backend),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn static_errors_are_terminal_and_never_forwarded() {
        let secp = Secp256k1::new();
        let keys = keys(1);
        let (backend, coordinator) = two_phase_backend(Some(true));
        let sentinel = Sentinel::new(keys.secrets[0], keys.publics.clone(), 1, vec![], backend);

        let mut tx = spendable_tx(&secp);
        tx.outputs[0].value = 1;

        let response = sentinel.execute(tx).await;
        assert_eq!(response.status, TxStatus::StaticInvalid);
        assert_eq!(response.error, Some(TxValidationError::AsymmetricValues));
        assert!(coordinator.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_sentinel_confirms_through_coordinator() {
        let secp = Secp256k1::new();
        let keys = keys(1);
        let (backend, coordinator) = two_phase_backend(Some(true));
        let sentinel = Sentinel::new(keys.secrets[0], keys.publics.clone(), 1, vec![], backend);

        let response = sentinel.execute(spendable_tx(&secp)).await;
        assert_eq!(response.status, TxStatus::Confirmed);

        // The forwarded compact tx carries this sentinel's attestation.
        let seen = coordinator.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].sufficiently_attested(&secp, &keys.publics, 1));
    }

    #[tokio::test]
    async fn quorum_is_gathered_from_peers() {
        let secp = Secp256k1::new();
        let keys = keys(3);
        let peers: Vec<Arc<dyn SentinelPeer>> = vec![
            peer(keys.secrets[1], keys.publics.clone(), 3),
            peer(keys.secrets[2], keys.publics.clone(), 3),
        ];
        let (backend, coordinator) = two_phase_backend(Some(true));
        let sentinel = Sentinel::new(keys.secrets[0], keys.publics.clone(), 3, peers, backend);

        let response = sentinel.execute(spendable_tx(&secp)).await;
        assert_eq!(response.status, TxStatus::Confirmed);

        let seen = coordinator.seen.lock().unwrap();
        assert!(seen[0].sufficiently_attested(&secp, &keys.publics, 3));
    }

    #[tokio::test]
    async fn exhausted_peers_without_quorum_is_state_invalid() {
        let secp = Secp256k1::new();
        let keys = keys(3);
        // Only one peer exists but three attestations are required.
        let peers: Vec<Arc<dyn SentinelPeer>> = vec![peer(keys.secrets[1], keys.publics.clone(), 3)];
        let (backend, coordinator) = two_phase_backend(Some(true));
        let sentinel = Sentinel::new(keys.secrets[0], keys.publics.clone(), 3, peers, backend);

        let response = sentinel.execute(spendable_tx(&secp)).await;
        assert_eq!(response.status, TxStatus::StateInvalid);
        assert!(coordinator.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn coordinator_rejection_maps_to_state_invalid() {
        let secp = Secp256k1::new();
        let keys = keys(1);
        let (backend, _) = two_phase_backend(Some(false));
        let sentinel = Sentinel::new(keys.secrets[0], keys.publics.clone(), 1, vec![], backend);
        let response = sentinel.execute(spendable_tx(&secp)).await;
        assert_eq!(response.status, TxStatus::StateInvalid);
    }

    #[tokio::test]
    async fn validate_attests_only_valid_transactions() {
        let secp = Secp256k1::new();
        let keys = keys(1);
        let (backend, _) = two_phase_backend(Some(true));
        let sentinel = Sentinel::new(keys.secrets[0], keys.publics.clone(), 1, vec![], backend);

        let tx = spendable_tx(&secp);
        let (public_key, signature) = sentinel.validate(&tx).unwrap();
        assert_eq!(public_key, keys.publics[0]);
        assert!(verify_hash(&secp, &public_key, &tx.tx_id(), &signature));

        let mut invalid = tx;
        invalid.witnesses.clear();
        assert!(sentinel.validate(&invalid).is_none());
    }

    #[test]
    fn messages_round_trip() {
        let secp = Secp256k1::new();
        let tx = spendable_tx(&secp);
        let request = SentinelRequest::Execute(tx.clone());
        assert_eq!(SentinelRequest::decode(&request.encode()).unwrap(), request);

        let response = SentinelResponse::Execute(ExecuteResponse {
            status: TxStatus::StaticInvalid,
            error: Some(TxValidationError::NoInputs),
        });
        assert_eq!(SentinelResponse::decode(&response.encode()).unwrap(), response);

        let keys = keys(1);
        let signature = sign_hash(&secp, &keys.secrets[0], &tx.tx_id());
        let response = SentinelResponse::Validate(Some((keys.publics[0], signature)));
        assert_eq!(SentinelResponse::decode(&response.encode()).unwrap(), response);
    }
}
