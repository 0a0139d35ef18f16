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
    archiver::{Archiver, ArchiverRequest, ArchiverResponse},
    atomizer::Block,
    network::{self, Subscriber},
    storage::FileStore,
};
use clap::Parser;
use log::*;

const LOG_TARGET: &str = "c::archiverd";

/// Archiver daemon: durably stores every published block and serves
/// back-fill queries.
#[derive(Parser)]
struct Cli {
    /// Path to the deployment config file.
    config: PathBuf,
    /// This archiver's id.
    archiver_id: usize,
    /// Path to the block database file.
    #[arg(long, default_value = "archiver.db")]
    db: PathBuf,
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
        .archiver_endpoints
        .get(cli.archiver_id)
        .cloned()
        .ok_or_else(|| ExitError::new(ExitCode::ConfigError, format!("unknown archiver id {}", cli.archiver_id)))?;
    let block_endpoint = opts
        .atomizer_block_endpoints
        .first()
        .cloned()
        .ok_or_else(|| ExitError::new(ExitCode::ConfigError, "no atomizer block endpoints configured"))?;

    let store = FileStore::open(&cli.db).map_err(|e| ExitError::new(ExitCode::StorageError, e))?;
    let archiver = Arc::new(Archiver::open(store).map_err(|e| ExitError::new(ExitCode::StorageError, e))?);
    info!(
        target: LOG_TARGET,
        "Archive opened at height {}", archiver.best_height()
    );

    {
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
                    Ok(block) => {
                        if let Err(e) = archiver.put(&block) {
                            error!(target: LOG_TARGET, "Failed to archive block {}: {}", block.height, e);
                        }
                    },
                    Err(e) => {
                        error!(target: LOG_TARGET, "Block subscription lost: {}", e);
                        return;
                    },
                }
            }
        });
    }

    let handler_archiver = archiver.clone();
    let server = network::serve(&endpoint, move |request: ArchiverRequest| {
        let archiver = handler_archiver.clone();
        async move {
            match request {
                ArchiverRequest::Get(height) => match archiver.get(height) {
                    Ok(block) => ArchiverResponse::Block(block),
                    Err(e) => {
                        error!(target: LOG_TARGET, "Get({}) failed: {}", height, e);
                        ArchiverResponse::Block(None)
                    },
                },
                ArchiverRequest::GetRange { lo, hi } => match archiver.get_range(lo, hi) {
                    Ok(blocks) => ArchiverResponse::Blocks(blocks),
                    Err(e) => {
                        error!(target: LOG_TARGET, "GetRange({}, {}) failed: {}", lo, hi, e);
                        ArchiverResponse::Blocks(Vec::new())
                    },
                },
                ArchiverRequest::BestHeight => ArchiverResponse::BestHeight(archiver.best_height()),
            }
        }
    })
    .await
    .map_err(|e| ExitError::new(ExitCode::NetworkError, e))?;

    info!(
        target: LOG_TARGET,
        "Archiver {} serving on {}", cli.archiver_id, server.local_addr()
    );
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ExitError::new(ExitCode::UnknownError, e))?;
    info!(target: LOG_TARGET, "Shutting down");
    Ok(())
}
