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
    network,
    sentinel::{
        RemoteAtomizerNotifier,
        RemoteSentinelPeer,
        RemoteShardNotifier,
        Sentinel,
        SentinelBackend,
        SentinelPeer,
        SentinelRequest,
        SentinelResponse,
        ShardNotifier,
    },
    coordinator::RemoteCoordinator,
};
use clap::Parser;
use log::*;

const LOG_TARGET: &str = "c::sentineld";

/// Sentinel daemon: validates client transactions, gathers peer
/// attestations and forwards to the settlement layer.
#[derive(Parser)]
struct Cli {
    /// Path to the deployment config file.
    config: PathBuf,
    /// This sentinel's id.
    sentinel_id: usize,
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
        .sentinel_endpoints
        .get(cli.sentinel_id)
        .cloned()
        .ok_or_else(|| ExitError::new(ExitCode::ConfigError, format!("unknown sentinel id {}", cli.sentinel_id)))?;
    let signing_key = opts
        .sentinel_private_keys
        .get(&cli.sentinel_id)
        .copied()
        .ok_or_else(|| {
            ExitError::new(
                ExitCode::ConfigError,
                format!("no private key configured for sentinel {}", cli.sentinel_id),
            )
        })?;

    let peers: Vec<Arc<dyn SentinelPeer>> = opts
        .sentinel_endpoints
        .iter()
        .enumerate()
        .filter(|(id, _)| *id != cli.sentinel_id)
        .map(|(_, ep)| Arc::new(RemoteSentinelPeer::new(ep.clone())) as Arc<dyn SentinelPeer>)
        .collect();

    let backend = if opts.two_phase_mode {
        let coordinator_endpoint = opts
            .coordinator_endpoints
            .first()
            .and_then(|cluster| cluster.first())
            .cloned()
            .ok_or_else(|| ExitError::new(ExitCode::ConfigError, "no coordinator endpoints configured"))?;
        SentinelBackend::TwoPhase {
            coordinator: Arc::new(RemoteCoordinator::new(coordinator_endpoint)),
        }
    } else {
        let atomizer_endpoint = opts
            .atomizer_endpoints
            .first()
            .cloned()
            .ok_or_else(|| ExitError::new(ExitCode::ConfigError, "no atomizer endpoints configured"))?;
        let shards = opts
            .shard_ranges
            .iter()
            .zip(&opts.shard_endpoints)
            .map(|(range, ep)| {
                (
                    *range,
                    Arc::new(RemoteShardNotifier::new(ep.clone())) as Arc<dyn ShardNotifier>,
                )
            })
            .collect();
        SentinelBackend::Atomizer {
            shards,
            atomizer: Arc::new(RemoteAtomizerNotifier::new(atomizer_endpoint)),
        }
    };

    let sentinel = Arc::new(Sentinel::new(
        signing_key,
        opts.sentinel_public_keys.clone(),
        opts.attestation_threshold,
        peers,
        backend,
    ));

    let server = network::serve(&endpoint, move |request: SentinelRequest| {
        let sentinel = sentinel.clone();
        async move {
            match request {
                SentinelRequest::Execute(tx) => SentinelResponse::Execute(sentinel.execute(tx).await),
                SentinelRequest::Validate(tx) => SentinelResponse::Validate(sentinel.validate(&tx)),
            }
        }
    })
    .await
    .map_err(|e| ExitError::new(ExitCode::NetworkError, e))?;

    info!(
        target: LOG_TARGET,
        "Sentinel {} serving on {}", cli.sentinel_id, server.local_addr()
    );
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ExitError::new(ExitCode::UnknownError, e))?;
    info!(target: LOG_TARGET, "Shutting down");
    Ok(())
}
