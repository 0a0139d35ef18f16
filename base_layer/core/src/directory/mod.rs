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

//! Deterministic UHS-id routing. Every node evaluates the same pure mapping
//! from a UHS id to the shard responsible for it, so no directory service
//! needs to be consulted at runtime.

use cbdc_common::ShardRange;
use cbdc_common_types::Hash;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("No shard covers UHS ids with leading byte {0:#04x}")]
    Uncovered(u8),
}

/// Index of the first shard whose range contains the UHS id's leading byte.
/// Ranges may overlap for replication; routing always picks the first match
/// so it is identical on every node.
pub fn shard_for(uhs_id: &Hash, ranges: &[ShardRange]) -> Result<usize, DirectoryError> {
    let byte = uhs_id.range_byte();
    ranges
        .iter()
        .position(|range| range.contains_byte(byte))
        .ok_or(DirectoryError::Uncovered(byte))
}

#[cfg(test)]
mod test {
    use super::*;

    fn hash_with_leading_byte(byte: u8) -> Hash {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        Hash::from_bytes(bytes)
    }

    #[test]
    fn routes_to_covering_shard() {
        let ranges = vec![ShardRange::new(0, 127), ShardRange::new(128, 255)];
        assert_eq!(shard_for(&hash_with_leading_byte(0), &ranges), Ok(0));
        assert_eq!(shard_for(&hash_with_leading_byte(127), &ranges), Ok(0));
        assert_eq!(shard_for(&hash_with_leading_byte(128), &ranges), Ok(1));
        assert_eq!(shard_for(&hash_with_leading_byte(255), &ranges), Ok(1));
    }

    #[test]
    fn overlapping_ranges_use_first_match() {
        let ranges = vec![ShardRange::new(0, 255), ShardRange::new(0, 255)];
        assert_eq!(shard_for(&hash_with_leading_byte(9), &ranges), Ok(0));
    }

    #[test]
    fn uncovered_byte_is_an_error() {
        let ranges = vec![ShardRange::new(0, 100)];
        assert_eq!(
            shard_for(&hash_with_leading_byte(101), &ranges),
            Err(DirectoryError::Uncovered(101))
        );
    }
}
