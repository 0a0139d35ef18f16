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

use cbdc_common_types::{Hash, PublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::{CodecError, Decode, Encode, Reader};

/// Witness program type byte for pay-to-public-key with SHA-256 commitment
/// and a BIP-340 Schnorr signature.
pub const P2PK_WITNESS_TYPE: u8 = 0x00;

/// Total length of a P2PK witness: type byte, x-only key, signature.
pub const P2PK_WITNESS_LEN: usize = 1 + 32 + 64;

/// Spend authorization data attached to each input. The first byte selects
/// the witness program type.
pub type Witness = Vec<u8>;

/// Uniquely names an output produced by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_id: Hash,
    pub index: u64,
}

impl OutPoint {
    pub fn new(tx_id: Hash, index: u64) -> Self {
        Self { tx_id, index }
    }
}

/// A single transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Output {
    /// Commitment to the spend policy, typically [`witness_commitment`] of a
    /// public key.
    pub witness_program_commitment: Hash,
    /// Value in the base unit of the currency.
    pub value: u64,
}

impl Output {
    pub fn new(witness_program_commitment: Hash, value: u64) -> Self {
        Self {
            witness_program_commitment,
            value,
        }
    }
}

/// A reference to an unspent output being consumed, together with a copy of
/// the output so its UHS id can be recomputed without a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Input {
    pub out_point: OutPoint,
    pub output: Output,
}

impl Input {
    pub fn new(out_point: OutPoint, output: Output) -> Self {
        Self { out_point, output }
    }

    /// The hash identifying this input in the unspent set.
    pub fn uhs_id(&self) -> Hash {
        uhs_id(&self.out_point, &self.output)
    }
}

/// A complete signed transaction as submitted to a sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTransaction {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    /// One witness per input, in input order.
    pub witnesses: Vec<Witness>,
}

impl FullTransaction {
    /// The transaction id: SHA-256 over the inputs' out-points followed by
    /// the outputs.
    pub fn tx_id(&self) -> Hash {
        let mut hasher = Sha256::new();
        for input in &self.inputs {
            hasher.update(input.out_point.encode());
        }
        for output in &self.outputs {
            hasher.update(output.encode());
        }
        Hash::from_bytes(hasher.finalize().into())
    }

    /// The out-point naming this transaction's `index`th output.
    pub fn out_point(&self, index: u64) -> OutPoint {
        OutPoint::new(self.tx_id(), index)
    }
}

/// The hash identifying an unspent output in the UHS: SHA-256 over the
/// out-point and the output it names.
pub fn uhs_id(out_point: &OutPoint, output: &Output) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(out_point.encode());
    hasher.update(output.encode());
    Hash::from_bytes(hasher.finalize().into())
}

/// Commitment a P2PK output makes to its spending key.
pub fn witness_commitment(public_key: &PublicKey) -> Hash {
    let mut data = Vec::with_capacity(33);
    data.push(P2PK_WITNESS_TYPE);
    data.extend_from_slice(&public_key.serialize());
    Hash::digest(&data)
}

/// Convert the `index`th output of a transaction into an input spending it.
/// Returns `None` if the index is out of range.
pub fn input_from_output(tx: &FullTransaction, index: u64) -> Option<Input> {
    let output = tx.outputs.get(index as usize)?;
    Some(Input::new(tx.out_point(index), *output))
}

impl Encode for OutPoint {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.tx_id.encode_into(buf);
        self.index.encode_into(buf);
    }
}

impl Decode for OutPoint {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            tx_id: Hash::decode_from(reader)?,
            index: u64::decode_from(reader)?,
        })
    }
}

impl Encode for Output {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.witness_program_commitment.encode_into(buf);
        self.value.encode_into(buf);
    }
}

impl Decode for Output {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            witness_program_commitment: Hash::decode_from(reader)?,
            value: u64::decode_from(reader)?,
        })
    }
}

impl Encode for Input {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.out_point.encode_into(buf);
        self.output.encode_into(buf);
    }
}

impl Decode for Input {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            out_point: OutPoint::decode_from(reader)?,
            output: Output::decode_from(reader)?,
        })
    }
}

impl Encode for FullTransaction {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.inputs.encode_into(buf);
        self.outputs.encode_into(buf);
        self.witnesses.encode_into(buf);
    }
}

impl Decode for FullTransaction {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            inputs: Vec::decode_from(reader)?,
            outputs: Vec::decode_from(reader)?,
            witnesses: Vec::decode_from(reader)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_tx() -> FullTransaction {
        let prev = OutPoint::new(Hash::digest(b"prev"), 0);
        let consumed = Output::new(Hash::digest(b"policy"), 100);
        FullTransaction {
            inputs: vec![Input::new(prev, consumed)],
            outputs: vec![
                Output::new(Hash::digest(b"to"), 60),
                Output::new(Hash::digest(b"change"), 40),
            ],
            witnesses: vec![vec![0u8; P2PK_WITNESS_LEN]],
        }
    }

    #[test]
    fn tx_id_is_deterministic() {
        let tx = sample_tx();
        assert_eq!(tx.tx_id(), tx.tx_id());
    }

    #[test]
    fn tx_id_ignores_witness_data() {
        let mut tx = sample_tx();
        let id = tx.tx_id();
        tx.witnesses[0][40] ^= 0xff;
        assert_eq!(tx.tx_id(), id);
    }

    #[test]
    fn tx_id_changes_with_outputs() {
        let mut tx = sample_tx();
        let id = tx.tx_id();
        tx.outputs[0].value += 1;
        assert_ne!(tx.tx_id(), id);
    }

    #[test]
    fn uhs_ids_differ_per_out_point() {
        let tx = sample_tx();
        let a = input_from_output(&tx, 0).unwrap();
        let b = input_from_output(&tx, 1).unwrap();
        assert_ne!(a.uhs_id(), b.uhs_id());
    }

    #[test]
    fn input_from_output_rejects_out_of_range() {
        let tx = sample_tx();
        assert!(input_from_output(&tx, 2).is_none());
    }

    #[test]
    fn full_transaction_round_trips() {
        let tx = sample_tx();
        assert_eq!(FullTransaction::decode(&tx.encode()).unwrap(), tx);
    }
}
