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

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use cbdc_common_types::{Hash, PublicKey, SecretKey};
use cbdc_core::{
    coordinator::CoordinatorClient,
    locking_shard::{LockingShardRequest, LockingShardResponse},
    network::RpcClient,
    sentinel::{AtomizerNotifier, ExecuteResponse, SentinelRequest, SentinelResponse, TxStatus},
    transactions::{CompactTransaction, FullTransaction},
    watchtower::{
        SearchStatus,
        StatusUpdateRequest,
        StatusUpdateResponse,
        WatchtowerRequest,
        WatchtowerResponse,
    },
};
use log::*;
use secp256k1::Secp256k1;
use tokio::sync::Mutex;

use crate::{Wallet, WalletError};

const LOG_TARGET: &str = "c::client";

/// How clients reach a sentinel.
#[async_trait]
pub trait SentinelClient: Send + Sync {
    /// Submit a transaction; `None` means the sentinel was unreachable.
    async fn execute(&self, tx: FullTransaction) -> Option<ExecuteResponse>;
}

/// How atomizer-architecture clients query settlement status.
#[async_trait]
pub trait WatchtowerClient: Send + Sync {
    async fn status_update(&self, request: StatusUpdateRequest) -> Option<StatusUpdateResponse>;
    async fn best_block_height(&self) -> Option<u64>;
}

/// How two-phase-commit clients query settlement status from a locking
/// shard's read-only endpoint.
#[async_trait]
pub trait ShardStatusClient: Send + Sync {
    async fn check_tx_id(&self, tx_id: Hash) -> Option<bool>;
    async fn check_unspent(&self, uhs_id: Hash) -> Option<bool>;
}

/// Architecture-specific status oracle.
pub enum SyncBackend {
    Atomizer(Arc<dyn WatchtowerClient>),
    TwoPhase(Arc<dyn ShardStatusClient>),
}

/// Where quorum-signed mint transactions are submitted.
pub enum MintSubmitter {
    Coordinator(Arc<dyn CoordinatorClient>),
    Atomizer(Arc<dyn AtomizerNotifier>),
}

/// Sentinel keys and submission path needed to mint. Only test and demo
/// deployments configure this.
pub struct MintAuthority {
    pub sentinel_secrets: Vec<SecretKey>,
    pub submitter: MintSubmitter,
}

/// External client for sending transactions to the system and reconciling
/// local wallet state with settlement outcomes.
pub struct Client {
    wallet: Mutex<Wallet>,
    wallet_path: Option<PathBuf>,
    sentinel: Arc<dyn SentinelClient>,
    sync_backend: SyncBackend,
    mint_authority: Option<MintAuthority>,
    abandon_interval: Duration,
}

impl Client {
    pub fn new(
        wallet: Wallet,
        sentinel: Arc<dyn SentinelClient>,
        sync_backend: SyncBackend,
        abandon_interval: Duration,
    ) -> Self {
        Self {
            wallet: Mutex::new(wallet),
            wallet_path: None,
            sentinel,
            sync_backend,
            mint_authority: None,
            abandon_interval,
        }
    }

    /// Persist the wallet to `path` after every state change.
    pub fn with_wallet_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.wallet_path = Some(path.into());
        self
    }

    pub fn with_mint_authority(mut self, mint_authority: MintAuthority) -> Self {
        self.mint_authority = Some(mint_authority);
        self
    }

    pub async fn new_address(&self) -> PublicKey {
        let mut wallet = self.wallet.lock().await;
        let address = wallet.new_address();
        self.persist(&wallet);
        address
    }

    pub async fn balance(&self) -> u64 {
        self.wallet.lock().await.balance()
    }

    pub async fn utxo_count(&self) -> usize {
        self.wallet.lock().await.utxo_count()
    }

    pub async fn pending_tx_count(&self) -> usize {
        self.wallet.lock().await.pending_tx_count()
    }

    pub async fn pending_input_count(&self) -> usize {
        self.wallet.lock().await.pending_input_count()
    }

    /// Send `value` to `payee`. Returns the transaction (if one could be
    /// constructed) and the sentinel's response (if it was reachable).
    pub async fn send(
        &self,
        value: u64,
        payee: &PublicKey,
    ) -> Result<(FullTransaction, Option<ExecuteResponse>), WalletError> {
        self.submit(vec![(*payee, value)]).await
    }

    /// Send `count` outputs of `value` each to `payee` in one transaction.
    pub async fn fan(
        &self,
        count: usize,
        value: u64,
        payee: &PublicKey,
    ) -> Result<(FullTransaction, Option<ExecuteResponse>), WalletError> {
        self.submit(vec![(*payee, value); count]).await
    }

    async fn submit(
        &self,
        payments: Vec<(PublicKey, u64)>,
    ) -> Result<(FullTransaction, Option<ExecuteResponse>), WalletError> {
        let tx = {
            let mut wallet = self.wallet.lock().await;
            let tx = wallet.create_transaction(&payments)?;
            self.persist(&wallet);
            tx
        };
        let tx_id = tx.tx_id();

        let response = self.sentinel.execute(tx.clone()).await;
        match response {
            Some(response) => match response.status {
                TxStatus::Confirmed => {
                    self.confirm_transaction(&tx_id).await;
                },
                TxStatus::StaticInvalid | TxStatus::StateInvalid => {
                    debug!(target: LOG_TARGET, "Abandoning rejected tx {}", tx_id);
                    self.abandon_transaction(&tx_id).await;
                },
                TxStatus::Pending => {},
            },
            None => {
                warn!(target: LOG_TARGET, "Sentinel unreachable for tx {}", tx_id);
            },
        }
        Ok((tx, response))
    }

    /// Create `n_outputs` outputs of `value` each from thin air, sign the
    /// compact form with the configured quorum of sentinel keys and submit
    /// it directly to the settlement layer. Bootstrap only.
    pub async fn mint(&self, n_outputs: usize, value: u64) -> Result<Option<FullTransaction>, WalletError> {
        let Some(authority) = &self.mint_authority else {
            warn!(target: LOG_TARGET, "Mint requested without a mint authority");
            return Ok(None);
        };

        let tx = {
            let mut wallet = self.wallet.lock().await;
            let tx = wallet.mint(n_outputs, value);
            self.persist(&wallet);
            tx
        };
        let tx_id = tx.tx_id();

        let secp = Secp256k1::new();
        let mut compact = CompactTransaction::from_full(&tx);
        for secret in &authority.sentinel_secrets {
            compact.attest(&secp, secret);
        }

        match &authority.submitter {
            MintSubmitter::Coordinator(coordinator) => match coordinator.execute(compact).await {
                Some(true) => {
                    self.confirm_transaction(&tx_id).await;
                    Ok(Some(tx))
                },
                Some(false) => {
                    self.abandon_transaction(&tx_id).await;
                    Ok(None)
                },
                None => {
                    warn!(target: LOG_TARGET, "Coordinator unreachable for mint {}", tx_id);
                    Ok(None)
                },
            },
            MintSubmitter::Atomizer(atomizer) => {
                if atomizer.insert_complete(compact).await {
                    // Confirmation arrives with the next block; sync picks
                    // it up.
                    Ok(Some(tx))
                } else {
                    warn!(target: LOG_TARGET, "Atomizer unreachable for mint {}", tx_id);
                    Ok(None)
                }
            },
        }
    }

    pub async fn import_send_input(&self, input: cbdc_core::transactions::Input) {
        let mut wallet = self.wallet.lock().await;
        wallet.import_send_input(input);
        self.persist(&wallet);
    }

    pub async fn confirm_transaction(&self, tx_id: &Hash) -> bool {
        let mut wallet = self.wallet.lock().await;
        let confirmed = wallet.confirm_transaction(tx_id);
        if confirmed {
            info!(target: LOG_TARGET, "Transaction {} confirmed", tx_id);
            self.persist(&wallet);
        }
        confirmed
    }

    pub async fn abandon_transaction(&self, tx_id: &Hash) -> bool {
        let mut wallet = self.wallet.lock().await;
        let abandoned = wallet.abandon_transaction(tx_id);
        if abandoned {
            self.persist(&wallet);
        }
        abandoned
    }

    /// Reconcile pending transactions and imported inputs against the
    /// status oracle. Returns false if any query failed.
    pub async fn sync(&self) -> bool {
        match &self.sync_backend {
            SyncBackend::Atomizer(watchtower) => self.sync_atomizer(watchtower.clone()).await,
            SyncBackend::TwoPhase(shards) => self.sync_two_phase(shards.clone()).await,
        }
    }

    async fn sync_two_phase(&self, shards: Arc<dyn ShardStatusClient>) -> bool {
        let mut success = true;
        let (pending_txs, pending_inputs) = {
            let wallet = self.wallet.lock().await;
            (wallet.pending_tx_ids(), wallet.pending_input_tx_ids())
        };

        for tx_id in pending_txs.into_iter().chain(pending_inputs) {
            match shards.check_tx_id(tx_id).await {
                Some(true) => {
                    self.confirm_transaction(&tx_id).await;
                },
                Some(false) => {
                    debug!(target: LOG_TARGET, "Transaction {} not yet settled", tx_id);
                },
                None => {
                    error!(target: LOG_TARGET, "Shard status query failed for {}", tx_id);
                    success = false;
                },
            }
        }

        self.abandon_expired().await;
        success
    }

    async fn sync_atomizer(&self, watchtower: Arc<dyn WatchtowerClient>) -> bool {
        let mut request = StatusUpdateRequest::default();
        {
            let wallet = self.wallet.lock().await;
            for tx_id in wallet.pending_tx_ids() {
                request.uhs_ids.insert(tx_id, wallet.pending_tx_uhs_ids(&tx_id));
            }
            for (tx_id, uhs_id) in wallet.pending_input_uhs_ids() {
                request.uhs_ids.entry(tx_id).or_default().push(uhs_id);
            }
        }
        if request.uhs_ids.is_empty() {
            return true;
        }

        let Some(response) = watchtower.status_update(request).await else {
            error!(target: LOG_TARGET, "Watchtower status query failed");
            return false;
        };

        for (tx_id, states) in response.states {
            // Any trace of the transaction in the block history means it
            // settled; an input-specific error means it never will.
            let settled = states
                .iter()
                .any(|s| matches!(s.status, SearchStatus::Spent | SearchStatus::Unspent));
            let rejected = states
                .iter()
                .any(|s| matches!(s.status, SearchStatus::InvalidInput | SearchStatus::TxRejected));
            if settled {
                self.confirm_transaction(&tx_id).await;
            } else if rejected {
                info!(target: LOG_TARGET, "Transaction {} rejected by settlement", tx_id);
                self.abandon_transaction(&tx_id).await;
            }
        }

        self.abandon_expired().await;
        true
    }

    /// Abandon pending transactions unknown to the system for longer than
    /// the configured interval.
    async fn abandon_expired(&self) {
        let expired = {
            let wallet = self.wallet.lock().await;
            wallet.expired_pending_txs(self.abandon_interval)
        };
        for tx_id in expired {
            info!(
                target: LOG_TARGET,
                "Abandoning tx {} unknown for more than {:?}", tx_id, self.abandon_interval
            );
            self.abandon_transaction(&tx_id).await;
        }
    }

    fn persist(&self, wallet: &Wallet) {
        if let Some(path) = &self.wallet_path {
            if let Err(e) = wallet.save(path) {
                error!(target: LOG_TARGET, "Failed to persist wallet: {}", e);
            }
        }
    }
}

/// RPC-backed sentinel client.
pub struct RemoteSentinel {
    client: RpcClient<SentinelRequest, SentinelResponse>,
}

impl RemoteSentinel {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: RpcClient::new(endpoint),
        }
    }
}

#[async_trait]
impl SentinelClient for RemoteSentinel {
    async fn execute(&self, tx: FullTransaction) -> Option<ExecuteResponse> {
        match self.client.call(&SentinelRequest::Execute(tx)).await {
            Ok(SentinelResponse::Execute(response)) => Some(response),
            _ => None,
        }
    }
}

/// RPC-backed watchtower client.
pub struct RemoteWatchtower {
    client: RpcClient<WatchtowerRequest, WatchtowerResponse>,
}

impl RemoteWatchtower {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: RpcClient::new(endpoint),
        }
    }
}

#[async_trait]
impl WatchtowerClient for RemoteWatchtower {
    async fn status_update(&self, request: StatusUpdateRequest) -> Option<StatusUpdateResponse> {
        match self.client.call(&WatchtowerRequest::StatusUpdate(request)).await {
            Ok(WatchtowerResponse::StatusUpdate(response)) => Some(response),
            _ => None,
        }
    }

    async fn best_block_height(&self) -> Option<u64> {
        match self.client.call(&WatchtowerRequest::BestBlockHeight).await {
            Ok(WatchtowerResponse::BestBlockHeight(height)) => Some(height),
            _ => None,
        }
    }
}

/// RPC-backed locking shard read-only status client. Routes every query to
/// the one configured endpoint; deployments with multiple shards layer
/// routing on top.
pub struct RemoteShardStatus {
    client: RpcClient<LockingShardRequest, LockingShardResponse>,
}

impl RemoteShardStatus {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: RpcClient::new(endpoint),
        }
    }
}

#[async_trait]
impl ShardStatusClient for RemoteShardStatus {
    async fn check_tx_id(&self, tx_id: Hash) -> Option<bool> {
        match self.client.call(&LockingShardRequest::CheckTxId(tx_id)).await {
            Ok(LockingShardResponse::Bool(known)) => Some(known),
            _ => None,
        }
    }

    async fn check_unspent(&self, uhs_id: Hash) -> Option<bool> {
        match self.client.call(&LockingShardRequest::CheckUnspent(uhs_id)).await {
            Ok(LockingShardResponse::Bool(unspent)) => Some(unspent),
            _ => None,
        }
    }
}
