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

use std::collections::HashSet;

use cbdc_common_types::{verify_hash, PublicKey, Signature};
use secp256k1::{Secp256k1, Verification};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    codec::{CodecError, Decode, Encode, Reader},
    transactions::{witness_commitment, FullTransaction, Output, P2PK_WITNESS_LEN, P2PK_WITNESS_TYPE},
};

/// Check failures for a single output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum OutputError {
    #[error("zero value")]
    ZeroValue,
}

/// Check failures for a single witness/input pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum WitnessError {
    #[error("unknown witness program type")]
    UnknownProgramType,
    #[error("malformed witness")]
    Malformed,
    #[error("witness program does not match output commitment")]
    ProgramMismatch,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
}

/// Why a full transaction failed static validation. Carries the offending
/// index where one exists. Permanent and client-visible; never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum TxValidationError {
    #[error("transaction has no inputs")]
    NoInputs,
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("witness count does not match input count")]
    MissingWitness,
    #[error("input {index} duplicates an earlier out-point")]
    DuplicateInput { index: u64 },
    #[error("input {index} references an invalid output: {source}")]
    InputDataError { index: u64, source: OutputError },
    #[error("output {index} failed validation: {source}")]
    OutputError { index: u64, source: OutputError },
    #[error("input and output values do not balance")]
    AsymmetricValues,
    #[error("witness {index} failed validation: {source}")]
    WitnessError { index: u64, source: WitnessError },
}

/// Statically validate a full transaction. Pure: no I/O, no state; safe to
/// run concurrently. Checks run in a fixed order and the first failure wins.
pub fn validate_transaction<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &FullTransaction,
) -> Result<(), TxValidationError> {
    if tx.inputs.is_empty() {
        return Err(TxValidationError::NoInputs);
    }
    if tx.outputs.is_empty() {
        return Err(TxValidationError::NoOutputs);
    }
    if tx.witnesses.len() != tx.inputs.len() {
        return Err(TxValidationError::MissingWitness);
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for (index, input) in tx.inputs.iter().enumerate() {
        if !seen.insert(input.out_point) {
            return Err(TxValidationError::DuplicateInput { index: index as u64 });
        }
        check_output(&input.output).map_err(|source| TxValidationError::InputDataError {
            index: index as u64,
            source,
        })?;
    }

    for (index, output) in tx.outputs.iter().enumerate() {
        check_output(output).map_err(|source| TxValidationError::OutputError {
            index: index as u64,
            source,
        })?;
    }

    let input_total: u128 = tx.inputs.iter().map(|input| u128::from(input.output.value)).sum();
    let output_total: u128 = tx.outputs.iter().map(|output| u128::from(output.value)).sum();
    if input_total != output_total {
        return Err(TxValidationError::AsymmetricValues);
    }

    let tx_id = tx.tx_id();
    for (index, (witness, input)) in tx.witnesses.iter().zip(&tx.inputs).enumerate() {
        check_witness(secp, witness, input, &tx_id).map_err(|source| TxValidationError::WitnessError {
            index: index as u64,
            source,
        })?;
    }

    Ok(())
}

fn check_output(output: &Output) -> Result<(), OutputError> {
    if output.value == 0 {
        return Err(OutputError::ZeroValue);
    }
    Ok(())
}

fn check_witness<C: Verification>(
    secp: &Secp256k1<C>,
    witness: &[u8],
    input: &crate::transactions::Input,
    tx_id: &cbdc_common_types::Hash,
) -> Result<(), WitnessError> {
    let type_byte = *witness.first().ok_or(WitnessError::Malformed)?;
    match type_byte {
        P2PK_WITNESS_TYPE => check_p2pk_witness(secp, witness, input, tx_id),
        _ => Err(WitnessError::UnknownProgramType),
    }
}

fn check_p2pk_witness<C: Verification>(
    secp: &Secp256k1<C>,
    witness: &[u8],
    input: &crate::transactions::Input,
    tx_id: &cbdc_common_types::Hash,
) -> Result<(), WitnessError> {
    if witness.len() != P2PK_WITNESS_LEN {
        return Err(WitnessError::Malformed);
    }
    let public_key = PublicKey::from_slice(&witness[1..33]).map_err(|_| WitnessError::InvalidPublicKey)?;
    if witness_commitment(&public_key) != input.output.witness_program_commitment {
        return Err(WitnessError::ProgramMismatch);
    }
    let signature = Signature::from_slice(&witness[33..]).map_err(|_| WitnessError::Malformed)?;
    if !verify_hash(secp, &public_key, tx_id, &signature) {
        return Err(WitnessError::InvalidSignature);
    }
    Ok(())
}

impl Encode for OutputError {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            OutputError::ZeroValue => buf.push(0),
        }
    }
}

impl Decode for OutputError {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(OutputError::ZeroValue),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "OutputError",
            }),
        }
    }
}

impl Encode for WitnessError {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        let tag = match self {
            WitnessError::UnknownProgramType => 0,
            WitnessError::Malformed => 1,
            WitnessError::ProgramMismatch => 2,
            WitnessError::InvalidPublicKey => 3,
            WitnessError::InvalidSignature => 4,
        };
        buf.push(tag);
    }
}

impl Decode for WitnessError {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(WitnessError::UnknownProgramType),
            1 => Ok(WitnessError::Malformed),
            2 => Ok(WitnessError::ProgramMismatch),
            3 => Ok(WitnessError::InvalidPublicKey),
            4 => Ok(WitnessError::InvalidSignature),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "WitnessError",
            }),
        }
    }
}

impl Encode for TxValidationError {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            TxValidationError::NoInputs => buf.push(0),
            TxValidationError::NoOutputs => buf.push(1),
            TxValidationError::MissingWitness => buf.push(2),
            TxValidationError::DuplicateInput { index } => {
                buf.push(3);
                index.encode_into(buf);
            },
            TxValidationError::InputDataError { index, source } => {
                buf.push(4);
                index.encode_into(buf);
                source.encode_into(buf);
            },
            TxValidationError::OutputError { index, source } => {
                buf.push(5);
                index.encode_into(buf);
                source.encode_into(buf);
            },
            TxValidationError::AsymmetricValues => buf.push(6),
            TxValidationError::WitnessError { index, source } => {
                buf.push(7);
                index.encode_into(buf);
                source.encode_into(buf);
            },
        }
    }
}

impl Decode for TxValidationError {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(TxValidationError::NoInputs),
            1 => Ok(TxValidationError::NoOutputs),
            2 => Ok(TxValidationError::MissingWitness),
            3 => Ok(TxValidationError::DuplicateInput {
                index: u64::decode_from(reader)?,
            }),
            4 => Ok(TxValidationError::InputDataError {
                index: u64::decode_from(reader)?,
                source: OutputError::decode_from(reader)?,
            }),
            5 => Ok(TxValidationError::OutputError {
                index: u64::decode_from(reader)?,
                source: OutputError::decode_from(reader)?,
            }),
            6 => Ok(TxValidationError::AsymmetricValues),
            7 => Ok(TxValidationError::WitnessError {
                index: u64::decode_from(reader)?,
                source: WitnessError::decode_from(reader)?,
            }),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "TxValidationError",
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use cbdc_common_types::{new_keypair, sign_hash, Hash, SecretKey};

    use super::*;
    use crate::transactions::{Input, OutPoint};

    struct Fixture {
        secp: Secp256k1<secp256k1::All>,
        secret: SecretKey,
        public: PublicKey,
    }

    impl Fixture {
        fn new() -> Self {
            let secp = Secp256k1::new();
            let (secret, public) = new_keypair(&secp, &mut rand::thread_rng());
            Self { secp, secret, public }
        }

        /// A balanced single-input single-output transaction spendable by
        /// this fixture's key, with a valid witness.
        fn signed_tx(&self) -> FullTransaction {
            let mut tx = self.unsigned_tx();
            self.sign(&mut tx);
            tx
        }

        fn unsigned_tx(&self) -> FullTransaction {
            let commitment = witness_commitment(&self.public);
            FullTransaction {
                inputs: vec![Input::new(
                    OutPoint::new(Hash::digest(b"genesis"), 0),
                    Output::new(commitment, 100),
                )],
                outputs: vec![Output::new(commitment, 100)],
                witnesses: vec![],
            }
        }

        fn sign(&self, tx: &mut FullTransaction) {
            let tx_id = tx.tx_id();
            let signature = sign_hash(&self.secp, &self.secret, &tx_id);
            let mut witness = Vec::with_capacity(P2PK_WITNESS_LEN);
            witness.push(P2PK_WITNESS_TYPE);
            witness.extend_from_slice(&self.public.serialize());
            witness.extend_from_slice(&signature[..]);
            tx.witnesses = vec![witness; tx.inputs.len()];
        }
    }

    #[test]
    fn accepts_valid_transaction() {
        let fx = Fixture::new();
        assert_eq!(validate_transaction(&fx.secp, &fx.signed_tx()), Ok(()));
    }

    #[test]
    fn rejects_empty_inputs_before_outputs() {
        let fx = Fixture::new();
        let mut tx = fx.signed_tx();
        tx.inputs.clear();
        tx.outputs.clear();
        assert_eq!(validate_transaction(&fx.secp, &tx), Err(TxValidationError::NoInputs));
    }

    #[test]
    fn rejects_missing_witness() {
        let fx = Fixture::new();
        let mut tx = fx.signed_tx();
        tx.witnesses.clear();
        assert_eq!(
            validate_transaction(&fx.secp, &tx),
            Err(TxValidationError::MissingWitness)
        );
    }

    #[test]
    fn rejects_duplicate_input_with_index() {
        let fx = Fixture::new();
        let mut tx = fx.unsigned_tx();
        tx.inputs.push(tx.inputs[0]);
        tx.outputs[0].value = 200;
        fx.sign(&mut tx);
        assert_eq!(
            validate_transaction(&fx.secp, &tx),
            Err(TxValidationError::DuplicateInput { index: 1 })
        );
    }

    #[test]
    fn rejects_zero_value_output() {
        let fx = Fixture::new();
        let mut tx = fx.unsigned_tx();
        tx.outputs.push(Output::new(Hash::digest(b"o"), 0));
        fx.sign(&mut tx);
        assert_eq!(
            validate_transaction(&fx.secp, &tx),
            Err(TxValidationError::OutputError {
                index: 1,
                source: OutputError::ZeroValue
            })
        );
    }

    #[test]
    fn rejects_asymmetric_values() {
        let fx = Fixture::new();
        let mut tx = fx.unsigned_tx();
        tx.outputs[0].value = 1;
        fx.sign(&mut tx);
        assert_eq!(
            validate_transaction(&fx.secp, &tx),
            Err(TxValidationError::AsymmetricValues)
        );
    }

    #[test]
    fn rejects_witness_for_wrong_key() {
        let fx = Fixture::new();
        let other = Fixture::new();
        let mut tx = fx.unsigned_tx();
        // Witness signed by (and naming) a key the output does not commit to.
        other.sign(&mut tx);
        assert_eq!(
            validate_transaction(&fx.secp, &tx),
            Err(TxValidationError::WitnessError {
                index: 0,
                source: WitnessError::ProgramMismatch
            })
        );
    }

    #[test]
    fn rejects_bad_signature() {
        let fx = Fixture::new();
        let mut tx = fx.signed_tx();
        // Corrupt the signature bytes.
        let len = tx.witnesses[0].len();
        tx.witnesses[0][len - 1] ^= 0x01;
        assert_eq!(
            validate_transaction(&fx.secp, &tx),
            Err(TxValidationError::WitnessError {
                index: 0,
                source: WitnessError::InvalidSignature
            })
        );
    }

    #[test]
    fn rejects_unknown_witness_type() {
        let fx = Fixture::new();
        let mut tx = fx.signed_tx();
        tx.witnesses[0][0] = 0x7f;
        assert_eq!(
            validate_transaction(&fx.secp, &tx),
            Err(TxValidationError::WitnessError {
                index: 0,
                source: WitnessError::UnknownProgramType
            })
        );
    }

    #[test]
    fn errors_round_trip_on_the_wire() {
        let errors = [
            TxValidationError::NoInputs,
            TxValidationError::DuplicateInput { index: 3 },
            TxValidationError::InputDataError {
                index: 1,
                source: OutputError::ZeroValue,
            },
            TxValidationError::WitnessError {
                index: 2,
                source: WitnessError::InvalidSignature,
            },
        ];
        for err in errors {
            assert_eq!(TxValidationError::decode(&err.encode()).unwrap(), err);
        }
    }
}
