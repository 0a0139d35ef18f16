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

//! Key=value configuration shared by every daemon in a deployment. A single
//! config file describes the whole topology; each daemon picks out its own
//! section using the node id passed on its command line.

use std::{
    collections::HashMap,
    fmt,
    path::Path,
    str::FromStr,
    time::Duration,
};

use cbdc_common_types::{Hash, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An inclusive interval of leading UHS-id bytes served by a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    pub start: u8,
    pub end: u8,
}

impl ShardRange {
    pub fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// Whether a UHS id belongs to this range.
    pub fn contains(&self, uhs_id: &Hash) -> bool {
        let b = uhs_id.range_byte();
        self.start <= b && b <= self.end
    }

    pub fn contains_byte(&self, b: u8) -> bool {
        self.start <= b && b <= self.end
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Fully parsed deployment options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Whether the deployment runs the two-phase-commit architecture rather
    /// than the atomizer architecture (`2pc=1`).
    pub two_phase_mode: bool,
    /// Number of distinct sentinel attestations a compact transaction needs
    /// before the settlement layer will accept it.
    pub attestation_threshold: usize,
    /// Depth of the atomizer's spent-output cache window.
    pub stxo_cache_depth: usize,
    /// Interval between atomizer block cuts.
    pub target_block_interval: Duration,
    pub election_timeout_lower: u64,
    pub election_timeout_upper: u64,
    pub heartbeat: u64,
    /// Maximum transactions per coordinator batch.
    pub batch_size: usize,
    /// Upper bound on concurrently executing 2PC drivers per coordinator.
    pub max_threads: usize,
    /// Interval after which a client abandons an unconfirmed transaction.
    pub client_abandon_interval: Duration,

    pub shard_endpoints: Vec<String>,
    pub shard_ranges: Vec<ShardRange>,
    /// Read-only status endpoints for 2PC locking shards, parallel to
    /// `shard_endpoints`. Absent entries mean the shard exposes none.
    pub shard_readonly_endpoints: Vec<Option<String>>,

    pub atomizer_endpoints: Vec<String>,
    pub atomizer_raft_endpoints: Vec<String>,
    /// Endpoints on which atomizers publish cut blocks to subscribers
    /// (shards, archivers, watchtowers).
    pub atomizer_block_endpoints: Vec<String>,

    /// Blocks retained by a watchtower for status queries.
    pub watchtower_block_cache_size: usize,
    /// Errors retained by a watchtower for status queries.
    pub watchtower_error_cache_size: usize,

    pub sentinel_endpoints: Vec<String>,
    pub sentinel_public_keys: Vec<PublicKey>,
    /// Private keys are only present in the config of the sentinel that owns
    /// them, keyed by sentinel id.
    pub sentinel_private_keys: HashMap<usize, SecretKey>,

    /// Coordinator clusters; outer index is the coordinator id, inner the
    /// node id within the cluster.
    pub coordinator_endpoints: Vec<Vec<String>>,
    pub coordinator_raft_endpoints: Vec<Vec<String>>,

    pub archiver_endpoints: Vec<String>,
    pub watchtower_endpoints: Vec<String>,
}

const DEFAULT_ATTESTATION_THRESHOLD: usize = 1;
const DEFAULT_STXO_CACHE_DEPTH: usize = 2;
const DEFAULT_TARGET_BLOCK_INTERVAL_MS: u64 = 250;
const DEFAULT_ELECTION_TIMEOUT_LOWER: u64 = 1000;
const DEFAULT_ELECTION_TIMEOUT_UPPER: u64 = 2000;
const DEFAULT_HEARTBEAT: u64 = 250;
const DEFAULT_BATCH_SIZE: usize = 100_000;
const DEFAULT_MAX_THREADS: usize = 128;
const DEFAULT_CLIENT_ABANDON_INTERVAL_MS: u64 = 60_000;
const DEFAULT_WATCHTOWER_BLOCK_CACHE_SIZE: usize = 100;
const DEFAULT_WATCHTOWER_ERROR_CACHE_SIZE: usize = 10_000;

impl Options {
    /// Load options from a key=value config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::parse(&raw)
    }

    /// Parse options from config file contents.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let map = parse_lines(contents)?;

        let two_phase_mode = map.get_parse_or("2pc", 0u8)? != 0;
        let attestation_threshold = map.get_parse_or("attestation_threshold", DEFAULT_ATTESTATION_THRESHOLD)?;
        let stxo_cache_depth = map.get_parse_or("stxo_cache_depth", DEFAULT_STXO_CACHE_DEPTH)?;
        let target_block_interval =
            Duration::from_millis(map.get_parse_or("target_block_interval", DEFAULT_TARGET_BLOCK_INTERVAL_MS)?);
        let election_timeout_lower = map.get_parse_or("election_timeout_lower", DEFAULT_ELECTION_TIMEOUT_LOWER)?;
        let election_timeout_upper = map.get_parse_or("election_timeout_upper", DEFAULT_ELECTION_TIMEOUT_UPPER)?;
        let heartbeat = map.get_parse_or("heartbeat", DEFAULT_HEARTBEAT)?;
        let batch_size = map.get_parse_or("batch_size", DEFAULT_BATCH_SIZE)?;
        let max_threads = map.get_parse_or("max_threads", DEFAULT_MAX_THREADS)?;
        let client_abandon_interval =
            Duration::from_millis(map.get_parse_or("client_abandon_interval", DEFAULT_CLIENT_ABANDON_INTERVAL_MS)?);

        let shard_count: usize = map.get_parse_or("shard_count", 0usize)?;
        let mut shard_endpoints = Vec::with_capacity(shard_count);
        let mut shard_ranges = Vec::with_capacity(shard_count);
        let mut shard_readonly_endpoints = Vec::with_capacity(shard_count);
        for i in 0..shard_count {
            shard_endpoints.push(map.get_required(&format!("shard{}_endpoint", i))?.to_owned());
            let start: u8 = map.get_parse_required(&format!("shard{}_start", i))?;
            let end: u8 = map.get_parse_required(&format!("shard{}_end", i))?;
            if start > end {
                return Err(ConfigError::InvalidShardRange { shard: i, start, end });
            }
            shard_ranges.push(ShardRange::new(start, end));
            shard_readonly_endpoints.push(map.get(&format!("shard{}_readonly_endpoint", i)).map(str::to_owned));
        }

        let atomizer_count: usize = map.get_parse_or("atomizer_count", 0usize)?;
        let mut atomizer_endpoints = Vec::with_capacity(atomizer_count);
        let mut atomizer_raft_endpoints = Vec::with_capacity(atomizer_count);
        let mut atomizer_block_endpoints = Vec::with_capacity(atomizer_count);
        for i in 0..atomizer_count {
            atomizer_endpoints.push(map.get_required(&format!("atomizer{}_endpoint", i))?.to_owned());
            atomizer_raft_endpoints.push(map.get_required(&format!("atomizer{}_raft_endpoint", i))?.to_owned());
            atomizer_block_endpoints.push(map.get_required(&format!("atomizer{}_block_endpoint", i))?.to_owned());
        }

        let watchtower_block_cache_size =
            map.get_parse_or("watchtower_block_cache_size", DEFAULT_WATCHTOWER_BLOCK_CACHE_SIZE)?;
        let watchtower_error_cache_size =
            map.get_parse_or("watchtower_error_cache_size", DEFAULT_WATCHTOWER_ERROR_CACHE_SIZE)?;

        let sentinel_count: usize = map.get_parse_or("sentinel_count", 0usize)?;
        let mut sentinel_endpoints = Vec::with_capacity(sentinel_count);
        let mut sentinel_public_keys = Vec::with_capacity(sentinel_count);
        let mut sentinel_private_keys = HashMap::new();
        for i in 0..sentinel_count {
            sentinel_endpoints.push(map.get_required(&format!("sentinel{}_endpoint", i))?.to_owned());
            let pk_hex = map.get_required(&format!("sentinel{}_public_key", i))?;
            sentinel_public_keys.push(parse_public_key(&format!("sentinel{}_public_key", i), pk_hex)?);
            if let Some(sk_hex) = map.get(&format!("sentinel{}_private_key", i)) {
                sentinel_private_keys.insert(i, parse_secret_key(&format!("sentinel{}_private_key", i), sk_hex)?);
            }
        }

        let coordinator_count: usize = map.get_parse_or("coordinator_count", 0usize)?;
        let mut coordinator_endpoints = Vec::with_capacity(coordinator_count);
        let mut coordinator_raft_endpoints = Vec::with_capacity(coordinator_count);
        for i in 0..coordinator_count {
            let node_count: usize = map.get_parse_required(&format!("coordinator{}_count", i))?;
            let mut eps = Vec::with_capacity(node_count);
            let mut raft_eps = Vec::with_capacity(node_count);
            for j in 0..node_count {
                eps.push(map.get_required(&format!("coordinator{}_{}_endpoint", i, j))?.to_owned());
                raft_eps.push(
                    map.get_required(&format!("coordinator{}_{}_raft_endpoint", i, j))?
                        .to_owned(),
                );
            }
            coordinator_endpoints.push(eps);
            coordinator_raft_endpoints.push(raft_eps);
        }

        let archiver_count: usize = map.get_parse_or("archiver_count", 0usize)?;
        let mut archiver_endpoints = Vec::with_capacity(archiver_count);
        for i in 0..archiver_count {
            archiver_endpoints.push(map.get_required(&format!("archiver{}_endpoint", i))?.to_owned());
        }

        let watchtower_count: usize = map.get_parse_or("watchtower_count", 0usize)?;
        let mut watchtower_endpoints = Vec::with_capacity(watchtower_count);
        for i in 0..watchtower_count {
            watchtower_endpoints.push(map.get_required(&format!("watchtower{}_endpoint", i))?.to_owned());
        }

        if attestation_threshold > sentinel_count && sentinel_count > 0 {
            return Err(ConfigError::InvalidValue {
                key: "attestation_threshold".to_owned(),
                value: attestation_threshold.to_string(),
                reason: "exceeds sentinel_count".to_owned(),
            });
        }

        Ok(Self {
            two_phase_mode,
            attestation_threshold,
            stxo_cache_depth,
            target_block_interval,
            election_timeout_lower,
            election_timeout_upper,
            heartbeat,
            batch_size,
            max_threads,
            client_abandon_interval,
            shard_endpoints,
            shard_ranges,
            shard_readonly_endpoints,
            atomizer_endpoints,
            atomizer_raft_endpoints,
            atomizer_block_endpoints,
            watchtower_block_cache_size,
            watchtower_error_cache_size,
            sentinel_endpoints,
            sentinel_public_keys,
            sentinel_private_keys,
            coordinator_endpoints,
            coordinator_raft_endpoints,
            archiver_endpoints,
            watchtower_endpoints,
        })
    }
}

fn parse_public_key(key: &str, hex_str: &str) -> Result<PublicKey, ConfigError> {
    let bytes = hex::decode(hex_str).map_err(|e| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: hex_str.to_owned(),
        reason: e.to_string(),
    })?;
    PublicKey::from_slice(&bytes).map_err(|e| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: hex_str.to_owned(),
        reason: e.to_string(),
    })
}

fn parse_secret_key(key: &str, hex_str: &str) -> Result<SecretKey, ConfigError> {
    let bytes = hex::decode(hex_str).map_err(|e| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: hex_str.to_owned(),
        reason: e.to_string(),
    })?;
    SecretKey::from_slice(&bytes).map_err(|e| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: hex_str.to_owned(),
        reason: e.to_string(),
    })
}

struct RawConfig(HashMap<String, String>);

impl RawConfig {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn get_required(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingKey(key.to_owned()))
    }

    fn get_parse_required<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.get_required(key)?;
        raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_owned(),
            value: raw.to_owned(),
            reason: e.to_string(),
        })
    }

    fn get_parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_owned(),
                value: raw.to_owned(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}

fn parse_lines(contents: &str) -> Result<RawConfig, ConfigError> {
    let mut map = HashMap::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or(ConfigError::MalformedLine(line_no + 1))?;
        map.insert(key.trim().to_owned(), value.trim().trim_matches('"').to_owned());
    }
    Ok(RawConfig(map))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("Malformed config line {0}: expected key=value")]
    MalformedLine(usize),
    #[error("Missing required config key: {0}")]
    MissingKey(String),
    #[error("Invalid value for {key}: {value} ({reason})")]
    InvalidValue { key: String, value: String, reason: String },
    #[error("Invalid range for shard {shard}: start {start} > end {end}")]
    InvalidShardRange { shard: usize, start: u8, end: u8 },
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_keys() -> (String, String) {
        let secp = secp256k1::Secp256k1::new();
        let (sk, pk) = cbdc_common_types::new_keypair(&secp, &mut rand::thread_rng());
        (hex::encode(sk.secret_bytes()), hex::encode(pk.serialize()))
    }

    #[test]
    fn parses_full_topology() {
        let (sk, pk) = sample_keys();
        let contents = format!(
            "2pc=0\n\
             shard_count=2\n\
             shard0_endpoint=127.0.0.1:5556\n\
             shard0_start=0\n\
             shard0_end=127\n\
             shard1_endpoint=127.0.0.1:5557\n\
             shard1_start=128\n\
             shard1_end=255\n\
             atomizer_count=1\n\
             atomizer0_endpoint=127.0.0.1:5558\n\
             atomizer0_raft_endpoint=127.0.0.1:5559\n\
             atomizer0_block_endpoint=127.0.0.1:5561\n\
             sentinel_count=1\n\
             sentinel0_endpoint=127.0.0.1:5560\n\
             sentinel0_public_key={}\n\
             sentinel0_private_key={}\n\
             attestation_threshold=1\n\
             stxo_cache_depth=3\n\
             target_block_interval=100\n",
            pk, sk
        );
        let opts = Options::parse(&contents).unwrap();
        assert!(!opts.two_phase_mode);
        assert_eq!(opts.shard_endpoints.len(), 2);
        assert_eq!(opts.shard_ranges[0], ShardRange::new(0, 127));
        assert_eq!(opts.stxo_cache_depth, 3);
        assert_eq!(opts.target_block_interval, Duration::from_millis(100));
        assert_eq!(opts.sentinel_private_keys.len(), 1);
    }

    #[test]
    fn parses_coordinator_clusters() {
        let contents = "2pc=1\n\
                        coordinator_count=1\n\
                        coordinator0_count=2\n\
                        coordinator0_0_endpoint=127.0.0.1:6000\n\
                        coordinator0_0_raft_endpoint=127.0.0.1:6001\n\
                        coordinator0_1_endpoint=127.0.0.1:6002\n\
                        coordinator0_1_raft_endpoint=127.0.0.1:6003\n";
        let opts = Options::parse(contents).unwrap();
        assert!(opts.two_phase_mode);
        assert_eq!(opts.coordinator_endpoints.len(), 1);
        assert_eq!(opts.coordinator_endpoints[0].len(), 2);
        assert_eq!(opts.coordinator_raft_endpoints[0][1], "127.0.0.1:6003");
    }

    #[test]
    fn missing_key_is_an_error() {
        let err = Options::parse("shard_count=1\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(k) if k == "shard0_endpoint"));
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let err = Options::parse("2pc=1\nnot a config line\n").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedLine(2)));
    }

    #[test]
    fn inverted_shard_range_is_rejected() {
        let contents = "shard_count=1\n\
                        shard0_endpoint=127.0.0.1:5556\n\
                        shard0_start=200\n\
                        shard0_end=100\n";
        assert!(matches!(
            Options::parse(contents).unwrap_err(),
            ConfigError::InvalidShardRange { .. }
        ));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let opts = Options::parse("# a comment\n\n2pc=1\n").unwrap();
        assert!(opts.two_phase_mode);
    }

    #[test]
    fn shard_range_contains() {
        let range = ShardRange::new(16, 31);
        assert!(range.contains_byte(16));
        assert!(range.contains_byte(31));
        assert!(!range.contains_byte(15));
        assert!(!range.contains_byte(32));
    }
}
