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
    atomizer::Block,
    network::{self, Subscriber},
    watchtower::{Watchtower, WatchtowerRequest, WatchtowerResponse},
};
use clap::Parser;
use log::*;
use tokio::sync::RwLock;

const LOG_TARGET: &str = "c::watchtowerd";

/// Watchtower daemon: indexes recent blocks and settlement errors and
/// answers client status queries.
#[derive(Parser)]
struct Cli {
    /// Path to the deployment config file.
    config: PathBuf,
    /// This watchtower's id.
    watchtower_id: usize,
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
        .watchtower_endpoints
        .get(cli.watchtower_id)
        .cloned()
        .ok_or_else(|| {
            ExitError::new(
                ExitCode::ConfigError,
                format!("unknown watchtower id {}", cli.watchtower_id),
            )
        })?;
    let block_endpoint = opts
        .atomizer_block_endpoints
        .first()
        .cloned()
        .ok_or_else(|| ExitError::new(ExitCode::ConfigError, "no atomizer block endpoints configured"))?;

    let watchtower = Arc::new(RwLock::new(Watchtower::new(
        opts.watchtower_block_cache_size,
        opts.watchtower_error_cache_size,
    )));

    {
        let watchtower = watchtower.clone();
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
                    Ok(block) => watchtower.write().await.add_block(block),
                    Err(e) => {
                        error!(target: LOG_TARGET, "Block subscription lost: {}", e);
                        return;
                    },
                }
            }
        });
    }

    let handler_watchtower = watchtower.clone();
    let server = network::serve(&endpoint, move |request: WatchtowerRequest| {
        let watchtower = handler_watchtower.clone();
        async move {
            match request {
                WatchtowerRequest::StatusUpdate(status_request) => {
                    let response = watchtower.read().await.handle_status_update(&status_request);
                    WatchtowerResponse::StatusUpdate(response)
                },
                WatchtowerRequest::BestBlockHeight => {
                    WatchtowerResponse::BestBlockHeight(watchtower.read().await.best_block_height())
                },
                WatchtowerRequest::AddErrors(errors) => {
                    watchtower.write().await.add_errors(errors);
                    WatchtowerResponse::Ack
                },
            }
        }
    })
    .await
    .map_err(|e| ExitError::new(ExitCode::NetworkError, e))?;

    info!(
        target: LOG_TARGET,
        "Watchtower {} serving on {}", cli.watchtower_id, server.local_addr()
    );
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ExitError::new(ExitCode::UnknownError, e))?;
    info!(target: LOG_TARGET, "Shutting down");
    Ok(())
}
