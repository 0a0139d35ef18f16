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

use std::{path::PathBuf, process, sync::Arc};

use cbdc_common::{
    exit_codes::{ExitCode, ExitError},
    initialize_logging,
    Options,
};
use cbdc_core::{
    archiver::{ArchiverRequest, ArchiverResponse},
    atomizer::{AtomizerRequest, Block},
    network::{self, RpcClient, Subscriber},
    shard::{BlockResult, Shard},
    transactions::CompactTransaction,
    watchtower::{WatchtowerRequest, WatchtowerResponse},
};
use clap::Parser;
use log::*;
use tokio::sync::RwLock;

const LOG_TARGET: &str = "c::shardd";

/// Atomizer-architecture shard daemon: attests transaction inputs against
/// its range of the unspent set and applies published blocks in order.
#[derive(Parser)]
struct Cli {
    /// Path to the deployment config file.
    config: PathBuf,
    /// This shard's id.
    shard_id: usize,
}

fn main() {
    if let Err(err) = main_inner() {
        eprintln!("{}", err);
        error!(target: LOG_TARGET, "Exiting: {}", err);
        process::exit(err.exit_code as i32);
    }
}

#[tokio::main]
async fn main_inner() -> Result<(), ExitError> {
    initialize_logging();
    let cli = Cli::parse();
    let opts = Options::load(&cli.config)?;

    let endpoint = opts
        .shard_endpoints
        .get(cli.shard_id)
        .cloned()
        .ok_or_else(|| ExitError::new(ExitCode::ConfigError, format!("unknown shard id {}", cli.shard_id)))?;
    let range = opts.shard_ranges[cli.shard_id];
    let atomizer_endpoint = opts
        .atomizer_endpoints
        .first()
        .cloned()
        .ok_or_else(|| ExitError::new(ExitCode::ConfigError, "no atomizer endpoints configured"))?;
    let block_endpoint = opts
        .atomizer_block_endpoints
        .first()
        .cloned()
        .ok_or_else(|| ExitError::new(ExitCode::ConfigError, "no atomizer block endpoints configured"))?;

    let shard = Arc::new(RwLock::new(Shard::new(range)));
    let atomizer: Arc<RpcClient<AtomizerRequest, ()>> = Arc::new(RpcClient::new(atomizer_endpoint));
    let archiver: Option<Arc<RpcClient<ArchiverRequest, ArchiverResponse>>> = opts
        .archiver_endpoints
        .first()
        .map(|ep| Arc::new(RpcClient::new(ep.clone())));
    let watchtower: Option<Arc<RpcClient<WatchtowerRequest, WatchtowerResponse>>> = opts
        .watchtower_endpoints
        .first()
        .map(|ep| Arc::new(RpcClient::new(ep.clone())));

    // Apply published blocks in order, back-filling gaps from the archiver.
    {
        let shard = shard.clone();
        let archiver = archiver.clone();
        tokio::spawn(async move {
            let mut subscriber = match Subscriber::<Block>::connect(&block_endpoint).await {
                Ok(subscriber) => subscriber,
                Err(e) => {
                    error!(target: LOG_TARGET, "Failed to subscribe for blocks: {}", e);
                    return;
                },
            };
            loop {
                match subscriber.recv().await {
                    Ok(block) => apply_block(&shard, &archiver, block).await,
                    Err(e) => {
                        error!(target: LOG_TARGET, "Block subscription lost: {}", e);
                        return;
                    },
                }
            }
        });
    }

    let handler_shard = shard.clone();
    let server = network::serve(&endpoint, move |tx: CompactTransaction| {
        let shard = handler_shard.clone();
        let atomizer = atomizer.clone();
        let watchtower = watchtower.clone();
        async move {
            let digest = shard.read().await.digest_transaction(&tx);
            match digest {
                Ok(Some(notification)) => {
                    if let Err(e) = atomizer
                        .call(&AtomizerRequest::TxNotify(notification))
                        .await
                    {
                        warn!(target: LOG_TARGET, "Failed to notify atomizer: {}", e);
                    }
                },
                Ok(None) => {},
                Err(error) => {
                    debug!(target: LOG_TARGET, "Rejected notification: {}", error);
                    if let Some(watchtower) = &watchtower {
                        let _ = watchtower.call(&WatchtowerRequest::AddErrors(vec![error])).await;
                    }
                },
            }
        }
    })
    .await
    .map_err(|e| ExitError::new(ExitCode::NetworkError, e))?;

    info!(
        target: LOG_TARGET,
        "Shard {} covering {} serving on {}",
        cli.shard_id,
        range,
        server.local_addr()
    );
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ExitError::new(ExitCode::UnknownError, e))?;
    info!(target: LOG_TARGET, "Shutting down");
    Ok(())
}

async fn apply_block(
    shard: &Arc<RwLock<Shard>>,
    archiver: &Option<Arc<RpcClient<ArchiverRequest, ArchiverResponse>>>,
    block: Block,
) {
    let mut shard = shard.write().await;
    match shard.digest_block(&block) {
        BlockResult::Applied | BlockResult::Stale => {},
        BlockResult::MissingRange { start, end } => {
            let Some(archiver) = archiver else {
                error!(
                    target: LOG_TARGET,
                    "Missing blocks [{}, {}] and no archiver configured", start, end
                );
                return;
            };
            shard.set_syncing(true);
            match archiver.call(&ArchiverRequest::GetRange { lo: start, hi: end }).await {
                Ok(ArchiverResponse::Blocks(missing)) => {
                    for missing_block in missing {
                        if shard.digest_block(&missing_block) == BlockResult::Applied {
                            debug!(target: LOG_TARGET, "Back-filled block {}", missing_block.height);
                        }
                    }
                    shard.digest_block(&block);
                },
                Ok(_) | Err(_) => {
                    error!(
                        target: LOG_TARGET,
                        "Failed to back-fill blocks [{}, {}] from archiver", start, end
                    );
                },
            }
            shard.set_syncing(false);
        },
    }
}
