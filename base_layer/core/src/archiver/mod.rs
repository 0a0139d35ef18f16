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

//! Durable append-only block store. Shards and the watchtower back-fill
//! missed blocks from here; every block is persisted before the put is
//! acknowledged.

use std::sync::atomic::{AtomicU64, Ordering};

use log::*;
use thiserror::Error;

use crate::{
    atomizer::Block,
    codec::{CodecError, Decode, Encode, Reader},
    storage::{KeyValueStore, StorageError},
};

const LOG_TARGET: &str = "c::archiver";

#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Corrupt block record at height {height}: {reason}")]
    Corrupt { height: u64, reason: String },
}

/// Append-only log of blocks keyed by height.
pub struct Archiver<S> {
    store: S,
    best_height: AtomicU64,
}

impl<S: KeyValueStore> Archiver<S> {
    /// Open the archive, recovering the best stored height.
    pub fn open(store: S) -> Result<Self, ArchiverError> {
        let best_height = store
            .range(&0u64.to_be_bytes(), &u64::MAX.to_be_bytes())?
            .last()
            .map(|(key, _)| decode_height(key))
            .transpose()?
            .unwrap_or(0);
        debug!(target: LOG_TARGET, "Archive opened at height {}", best_height);
        Ok(Self {
            store,
            best_height: AtomicU64::new(best_height),
        })
    }

    pub fn best_height(&self) -> u64 {
        self.best_height.load(Ordering::Acquire)
    }

    /// Persist a block. Idempotent: re-putting an existing height is a
    /// no-op.
    pub fn put(&self, block: &Block) -> Result<(), ArchiverError> {
        let key = block.height.to_be_bytes();
        if self.store.get(&key)?.is_some() {
            return Ok(());
        }
        let value = bincode::serialize(block).map_err(|e| ArchiverError::Corrupt {
            height: block.height,
            reason: e.to_string(),
        })?;
        self.store.put(&key, &value)?;
        self.best_height.fetch_max(block.height, Ordering::AcqRel);
        trace!(target: LOG_TARGET, "Archived block {}", block.height);
        Ok(())
    }

    pub fn get(&self, height: u64) -> Result<Option<Block>, ArchiverError> {
        match self.store.get(&height.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_block(height, &bytes)?)),
            None => Ok(None),
        }
    }

    /// All stored blocks with heights in `[lo, hi]`, in height order.
    pub fn get_range(&self, lo: u64, hi: u64) -> Result<Vec<Block>, ArchiverError> {
        let entries = self.store.range(&lo.to_be_bytes(), &hi.to_be_bytes())?;
        let mut blocks = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let height = decode_height(&key)?;
            blocks.push(decode_block(height, &value)?);
        }
        Ok(blocks)
    }
}

fn decode_height(key: &[u8]) -> Result<u64, ArchiverError> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| ArchiverError::Corrupt {
        height: 0,
        reason: "invalid height key".to_owned(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_block(height: u64, bytes: &[u8]) -> Result<Block, ArchiverError> {
    bincode::deserialize(bytes).map_err(|e| ArchiverError::Corrupt {
        height,
        reason: e.to_string(),
    })
}

/// Wire requests served by the archiver endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiverRequest {
    Get(u64),
    GetRange { lo: u64, hi: u64 },
    BestHeight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiverResponse {
    Block(Option<Block>),
    Blocks(Vec<Block>),
    BestHeight(u64),
}

impl Encode for ArchiverRequest {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            ArchiverRequest::Get(height) => {
                buf.push(0);
                height.encode_into(buf);
            },
            ArchiverRequest::GetRange { lo, hi } => {
                buf.push(1);
                lo.encode_into(buf);
                hi.encode_into(buf);
            },
            ArchiverRequest::BestHeight => buf.push(2),
        }
    }
}

impl Decode for ArchiverRequest {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(ArchiverRequest::Get(u64::decode_from(reader)?)),
            1 => Ok(ArchiverRequest::GetRange {
                lo: u64::decode_from(reader)?,
                hi: u64::decode_from(reader)?,
            }),
            2 => Ok(ArchiverRequest::BestHeight),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "ArchiverRequest",
            }),
        }
    }
}

impl Encode for ArchiverResponse {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            ArchiverResponse::Block(block) => {
                buf.push(0);
                block.encode_into(buf);
            },
            ArchiverResponse::Blocks(blocks) => {
                buf.push(1);
                blocks.encode_into(buf);
            },
            ArchiverResponse::BestHeight(height) => {
                buf.push(2);
                height.encode_into(buf);
            },
        }
    }
}

impl Decode for ArchiverResponse {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(ArchiverResponse::Block(Option::decode_from(reader)?)),
            1 => Ok(ArchiverResponse::Blocks(Vec::decode_from(reader)?)),
            2 => Ok(ArchiverResponse::BestHeight(u64::decode_from(reader)?)),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "ArchiverResponse",
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::{FileStore, MemoryStore};

    #[test]
    fn stores_and_retrieves_blocks() {
        let archiver = Archiver::open(MemoryStore::new()).unwrap();
        archiver.put(&Block::new(1, vec![])).unwrap();
        archiver.put(&Block::new(2, vec![])).unwrap();

        assert_eq!(archiver.get(1).unwrap(), Some(Block::new(1, vec![])));
        assert_eq!(archiver.get(3).unwrap(), None);
        assert_eq!(archiver.best_height(), 2);
    }

    #[test]
    fn get_range_returns_blocks_in_order() {
        let archiver = Archiver::open(MemoryStore::new()).unwrap();
        for height in 1..=5 {
            archiver.put(&Block::new(height, vec![])).unwrap();
        }
        let blocks = archiver.get_range(2, 4).unwrap();
        let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![2, 3, 4]);
    }

    #[test]
    fn put_is_idempotent() {
        let archiver = Archiver::open(MemoryStore::new()).unwrap();
        let block = Block::new(1, vec![]);
        archiver.put(&block).unwrap();
        archiver.put(&block).unwrap();
        assert_eq!(archiver.get_range(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn best_height_is_recovered_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        {
            let archiver = Archiver::open(FileStore::open(&path).unwrap()).unwrap();
            archiver.put(&Block::new(7, vec![])).unwrap();
        }
        let archiver = Archiver::open(FileStore::open(&path).unwrap()).unwrap();
        assert_eq!(archiver.best_height(), 7);
        assert_eq!(archiver.get(7).unwrap(), Some(Block::new(7, vec![])));
    }

    #[test]
    fn requests_round_trip() {
        let requests = [
            ArchiverRequest::Get(4),
            ArchiverRequest::GetRange { lo: 1, hi: 9 },
            ArchiverRequest::BestHeight,
        ];
        for request in requests {
            assert_eq!(ArchiverRequest::decode(&request.encode()).unwrap(), request);
        }
        let response = ArchiverResponse::Blocks(vec![Block::new(1, vec![])]);
        assert_eq!(ArchiverResponse::decode(&response.encode()).unwrap(), response);
    }
}
