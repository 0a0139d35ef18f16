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

use std::{path::PathBuf, process, sync::Arc, time::Duration};

use cbdc_common::{
    exit_codes::{ExitCode, ExitError},
    initialize_logging,
    Options,
};
use cbdc_core::{
    coordinator::{Coordinator, CoordinatorRequest, CoordinatorResponse},
    locking_shard::{LockingShardClient, RemoteLockingShard},
    network,
};
use clap::Parser;
use log::*;
use tokio::sync::Semaphore;

const LOG_TARGET: &str = "c::coordinatord";

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Two-phase-commit coordinator daemon.
#[derive(Parser)]
struct Cli {
    /// Path to the deployment config file.
    config: PathBuf,
    /// This coordinator cluster's id.
    coordinator_id: usize,
    /// This node's id within the cluster.
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
        .coordinator_endpoints
        .get(cli.coordinator_id)
        .and_then(|cluster| cluster.get(cli.node_id))
        .cloned()
        .ok_or_else(|| {
            ExitError::new(
                ExitCode::ConfigError,
                format!("unknown coordinator {} node {}", cli.coordinator_id, cli.node_id),
            )
        })?;

    let shards: Vec<Arc<dyn LockingShardClient>> = opts
        .shard_endpoints
        .iter()
        .map(|ep| Arc::new(RemoteLockingShard::new(ep.clone())) as Arc<dyn LockingShardClient>)
        .collect();
    if shards.is_empty() {
        return Err(ExitError::new(ExitCode::ConfigError, "no shards configured"));
    }

    let coordinator = Arc::new(Coordinator::new(
        shards,
        opts.shard_ranges.clone(),
        cli.coordinator_id as u64,
        opts.sentinel_public_keys.clone(),
        opts.attestation_threshold,
        LOCK_TIMEOUT,
    ));

    // A fresh leader first completes or aborts whatever the previous one
    // left in flight.
    coordinator
        .recover()
        .await
        .map_err(|e| ExitError::new(ExitCode::NetworkError, e))?;

    let admitted = Arc::new(Semaphore::new(opts.max_threads));
    let handler_coordinator = coordinator.clone();
    let server = network::serve(&endpoint, move |request: CoordinatorRequest| {
        let coordinator = handler_coordinator.clone();
        let admitted = admitted.clone();
        async move {
            let CoordinatorRequest::Execute(tx) = request;
            let _permit = match admitted.acquire().await {
                Ok(permit) => permit,
                Err(_) => return CoordinatorResponse(None),
            };
            match coordinator.execute(&tx).await {
                Ok(committed) => CoordinatorResponse(Some(committed)),
                Err(e) => {
                    warn!(target: LOG_TARGET, "Execution failed for tx {}: {}", tx.tx_id, e);
                    CoordinatorResponse(None)
                },
            }
        }
    })
    .await
    .map_err(|e| ExitError::new(ExitCode::NetworkError, e))?;

    info!(
        target: LOG_TARGET,
        "Coordinator {} node {} serving on {}",
        cli.coordinator_id,
        cli.node_id,
        server.local_addr()
    );
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ExitError::new(ExitCode::UnknownError, e))?;
    info!(target: LOG_TARGET, "Shutting down");
    Ok(())
}
