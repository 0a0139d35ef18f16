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
    atomizer::{Atomizer, AtomizerRequest, AtomizerResponse, AtomizerStateMachine},
    network::{self, Broadcaster, RpcClient},
    replication::{LocalLog, ReplicatedLog},
    watchtower::{TxError, WatchtowerRequest, WatchtowerResponse},
};
use clap::Parser;
use log::*;

const LOG_TARGET: &str = "c::atomizerd";

/// Atomizer daemon: orders attested transactions into blocks behind a
/// replicated log and publishes each cut block to subscribers.
#[derive(Parser)]
struct Cli {
    /// Path to the deployment config file.
    config: PathBuf,
    /// This atomizer's id.
    node_id: usize,
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
        .atomizer_endpoints
        .get(cli.node_id)
        .cloned()
        .ok_or_else(|| ExitError::new(ExitCode::ConfigError, format!("unknown atomizer id {}", cli.node_id)))?;
    let block_endpoint = opts
        .atomizer_block_endpoints
        .get(cli.node_id)
        .cloned()
        .ok_or_else(|| ExitError::new(ExitCode::ConfigError, "missing atomizer block endpoint"))?;

    let log = LocalLog::spawn(AtomizerStateMachine::new(Atomizer::new(0, opts.stxo_cache_depth)));
    let blocks = Arc::new(
        Broadcaster::bind(&block_endpoint)
            .await
            .map_err(|e| ExitError::new(ExitCode::NetworkError, e))?,
    );
    let watchtower: Option<Arc<RpcClient<WatchtowerRequest, WatchtowerResponse>>> = opts
        .watchtower_endpoints
        .first()
        .map(|ep| Arc::new(RpcClient::new(ep.clone())));

    // Time-driven block cuts ride the replicated log so every replica
    // agrees on cut boundaries.
    {
        let log = log.clone();
        let blocks = blocks.clone();
        let watchtower = watchtower.clone();
        let interval = opts.target_block_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                match log.propose(cbdc_core::atomizer::AtomizerCommand::MakeBlock).await {
                    Ok(AtomizerResponse::Cut { block, errors }) => {
                        trace!(
                            target: LOG_TARGET,
                            "Cut block {} ({} txs)",
                            block.height,
                            block.transactions.len()
                        );
                        blocks.broadcast(&block);
                        report_errors(&watchtower, errors).await;
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!(target: LOG_TARGET, "Block cut failed: {}", e);
                        break;
                    },
                }
            }
        });
    }

    let handler_log = log.clone();
    let handler_watchtower = watchtower.clone();
    let server = network::serve(&endpoint, move |request: AtomizerRequest| {
        let log = handler_log.clone();
        let watchtower = handler_watchtower.clone();
        async move {
            match log.propose(request.into()).await {
                Ok(AtomizerResponse::Inserted { errors }) => report_errors(&watchtower, errors).await,
                Ok(_) => {},
                Err(e) => error!(target: LOG_TARGET, "Notification failed: {}", e),
            }
        }
    })
    .await
    .map_err(|e| ExitError::new(ExitCode::NetworkError, e))?;

    info!(
        target: LOG_TARGET,
        "Atomizer {} serving on {}, publishing blocks on {}",
        cli.node_id,
        server.local_addr(),
        blocks.local_addr()
    );
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ExitError::new(ExitCode::UnknownError, e))?;
    info!(target: LOG_TARGET, "Shutting down");
    Ok(())
}

async fn report_errors(
    watchtower: &Option<Arc<RpcClient<WatchtowerRequest, WatchtowerResponse>>>,
    errors: Vec<TxError>,
) {
    if errors.is_empty() {
        return;
    }
    let Some(watchtower) = watchtower else {
        for error in &errors {
            warn!(target: LOG_TARGET, "No watchtower configured for error: {}", error);
        }
        return;
    };
    if let Err(e) = watchtower.call(&WatchtowerRequest::AddErrors(errors)).await {
        warn!(target: LOG_TARGET, "Failed to report errors to watchtower: {}", e);
    }
}
