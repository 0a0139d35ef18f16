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
    locking_shard::{
        LockingShard,
        LockingShardClient,
        LockingShardRequest,
        LockingShardResponse,
        ReplicatedLockingShard,
        ShardClientError,
        ShardError,
    },
    network,
};
use clap::Parser;
use log::*;

const LOG_TARGET: &str = "c::locking_shardd";

/// Two-phase-commit locking shard daemon.
#[derive(Parser)]
struct Cli {
    /// Path to the deployment config file.
    config: PathBuf,
    /// This shard's id.
    shard_id: usize,
    /// This node's id within the shard raft cluster.
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
        .shard_endpoints
        .get(cli.shard_id)
        .cloned()
        .ok_or_else(|| ExitError::new(ExitCode::ConfigError, format!("unknown shard id {}", cli.shard_id)))?;
    let range = opts.shard_ranges[cli.shard_id];

    let shard = Arc::new(ReplicatedLockingShard::new(Arc::new(LockingShard::new(range))));

    let handler_shard = shard.clone();
    let handler = move |request: LockingShardRequest| {
        let shard = handler_shard.clone();
        async move { handle_request(&shard, request).await }
    };

    let server = network::serve(&endpoint, handler.clone())
        .await
        .map_err(|e| ExitError::new(ExitCode::NetworkError, e))?;

    // Read-only status endpoint, when configured.
    let readonly_server = match opts.shard_readonly_endpoints.get(cli.shard_id).cloned().flatten() {
        Some(readonly_endpoint) => Some(
            network::serve(&readonly_endpoint, handler)
                .await
                .map_err(|e| ExitError::new(ExitCode::NetworkError, e))?,
        ),
        None => None,
    };

    info!(
        target: LOG_TARGET,
        "Locking shard {} node {} covering {} serving on {}{}",
        cli.shard_id,
        cli.node_id,
        range,
        server.local_addr(),
        readonly_server
            .as_ref()
            .map(|s| format!(", read-only on {}", s.local_addr()))
            .unwrap_or_default()
    );
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ExitError::new(ExitCode::UnknownError, e))?;
    info!(target: LOG_TARGET, "Shutting down");
    Ok(())
}

async fn handle_request(shard: &ReplicatedLockingShard, request: LockingShardRequest) -> LockingShardResponse {
    match request {
        LockingShardRequest::TryLock {
            ticket,
            broker_id,
            key,
            mode,
            first_lock,
        } => LockingShardResponse::TryLock(flatten(shard.try_lock(ticket, broker_id, key, mode, first_lock).await)),
        LockingShardRequest::Prepare {
            ticket,
            broker_id,
            tx_id,
            updates,
        } => LockingShardResponse::Ack(flatten(shard.prepare(ticket, broker_id, tx_id, updates).await)),
        LockingShardRequest::Commit { ticket } => LockingShardResponse::Ack(flatten(shard.commit(ticket).await)),
        LockingShardRequest::Rollback { ticket } => {
            LockingShardResponse::Ack(flatten(shard.rollback(ticket).await))
        },
        LockingShardRequest::Finish { ticket } => LockingShardResponse::Ack(flatten(shard.finish(ticket).await)),
        LockingShardRequest::GetTickets { broker_id } => match shard.get_tickets(broker_id).await {
            Ok(tickets) => LockingShardResponse::Tickets(tickets),
            Err(_) => LockingShardResponse::Tickets(Default::default()),
        },
        LockingShardRequest::CheckTxId(tx_id) => LockingShardResponse::Bool(shard.check_tx_id(&tx_id)),
        LockingShardRequest::CheckUnspent(uhs_id) => LockingShardResponse::Bool(shard.check_unspent(&uhs_id)),
    }
}

/// Map client-layer errors back to the wire's shard errors. Replication
/// failures surface as an unknown-ticket state error the coordinator treats
/// as retryable during recovery.
fn flatten<T>(result: Result<T, ShardClientError>) -> Result<T, ShardError> {
    result.map_err(|e| match e {
        ShardClientError::Shard(shard_error) => shard_error,
        ShardClientError::Unreachable(reason) => {
            warn!(target: LOG_TARGET, "Replication unavailable: {}", reason);
            ShardError::UnknownTicket
        },
    })
}
