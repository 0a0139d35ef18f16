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

use std::collections::BTreeMap;

use cbdc_common_types::{sign_hash, verify_hash, Hash, PublicKey, SecretKey, Signature};
use secp256k1::{Secp256k1, Signing, Verification};
use serde::{Deserialize, Serialize};

use crate::{
    codec::{CodecError, Decode, Encode, Reader},
    transactions::FullTransaction,
};

/// The settlement-layer representation of a transaction: the transaction id,
/// the UHS ids it consumes and creates, and the sentinel attestations
/// accumulated for it. Raw witness data is discarded after sentinel
/// validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactTransaction {
    pub tx_id: Hash,
    /// UHS ids of the consumed outputs, in input order.
    pub inputs: Vec<Hash>,
    /// UHS ids of the created outputs, in output order.
    pub outputs: Vec<Hash>,
    /// Sentinel attestations keyed by sentinel public key. Keying by the
    /// public key collapses duplicate attestations from the same sentinel.
    pub attestations: BTreeMap<PublicKey, Signature>,
}

impl CompactTransaction {
    /// Compact a validated full transaction.
    pub fn from_full(tx: &FullTransaction) -> Self {
        let tx_id = tx.tx_id();
        let inputs = tx.inputs.iter().map(|input| input.uhs_id()).collect();
        let outputs = (0..tx.outputs.len() as u64)
            .map(|index| crate::transactions::uhs_id(&tx.out_point(index), &tx.outputs[index as usize]))
            .collect();
        Self {
            tx_id,
            inputs,
            outputs,
            attestations: BTreeMap::new(),
        }
    }

    /// Produce and record an attestation over this transaction's id.
    pub fn attest<C: Signing>(&mut self, secp: &Secp256k1<C>, secret: &SecretKey) -> (PublicKey, Signature) {
        let public_key = cbdc_common_types::public_key_from_secret(secp, secret);
        let signature = sign_hash(secp, secret, &self.tx_id);
        self.attestations.insert(public_key, signature);
        (public_key, signature)
    }

    /// Record an attestation received from a peer. Set-union semantics: an
    /// existing attestation from the same key is retained.
    pub fn insert_attestation(&mut self, public_key: PublicKey, signature: Signature) {
        self.attestations.entry(public_key).or_insert(signature);
    }

    /// Union another attestation set into this one.
    pub fn merge_attestations(&mut self, other: &BTreeMap<PublicKey, Signature>) {
        for (public_key, signature) in other {
            self.insert_attestation(*public_key, *signature);
        }
    }

    /// Count attestations from distinct configured sentinel keys whose
    /// signatures verify against the transaction id.
    pub fn verified_attestation_count<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        known_keys: &[PublicKey],
    ) -> usize {
        self.attestations
            .iter()
            .filter(|(public_key, signature)| {
                known_keys.contains(public_key) && verify_hash(secp, public_key, &self.tx_id, signature)
            })
            .count()
    }

    /// Whether the attestation set meets the configured threshold. Every
    /// signature is verified and attestations are deduplicated by key before
    /// counting.
    pub fn sufficiently_attested<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        known_keys: &[PublicKey],
        threshold: usize,
    ) -> bool {
        self.verified_attestation_count(secp, known_keys) >= threshold
    }
}

impl Encode for CompactTransaction {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.tx_id.encode_into(buf);
        self.inputs.encode_into(buf);
        self.outputs.encode_into(buf);
        self.attestations.encode_into(buf);
    }
}

impl Decode for CompactTransaction {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            tx_id: Hash::decode_from(reader)?,
            inputs: Vec::decode_from(reader)?,
            outputs: Vec::decode_from(reader)?,
            attestations: BTreeMap::decode_from(reader)?,
        })
    }
}

#[cfg(test)]
mod test {
    use cbdc_common_types::new_keypair;

    use super::*;
    use crate::transactions::{Input, OutPoint, Output};

    fn sample_full_tx() -> FullTransaction {
        FullTransaction {
            inputs: vec![Input::new(
                OutPoint::new(Hash::digest(b"prev"), 0),
                Output::new(Hash::digest(b"policy"), 50),
            )],
            outputs: vec![Output::new(Hash::digest(b"to"), 50)],
            witnesses: vec![vec![]],
        }
    }

    #[test]
    fn from_full_carries_ids() {
        let tx = sample_full_tx();
        let compact = CompactTransaction::from_full(&tx);
        assert_eq!(compact.tx_id, tx.tx_id());
        assert_eq!(compact.inputs, vec![tx.inputs[0].uhs_id()]);
        assert_eq!(compact.outputs.len(), 1);
        assert!(compact.attestations.is_empty());
    }

    #[test]
    fn attestation_threshold_requires_distinct_keys() {
        let secp = Secp256k1::new();
        let (secret, public) = new_keypair(&secp, &mut rand::thread_rng());
        let mut compact = CompactTransaction::from_full(&sample_full_tx());

        // Attesting twice with the same key collapses to one entry.
        compact.attest(&secp, &secret);
        compact.attest(&secp, &secret);
        assert_eq!(compact.attestations.len(), 1);
        assert!(compact.sufficiently_attested(&secp, &[public], 1));
        assert!(!compact.sufficiently_attested(&secp, &[public], 2));
    }

    #[test]
    fn unknown_keys_do_not_count() {
        let secp = Secp256k1::new();
        let (secret, _) = new_keypair(&secp, &mut rand::thread_rng());
        let (_, known) = new_keypair(&secp, &mut rand::thread_rng());
        let mut compact = CompactTransaction::from_full(&sample_full_tx());
        compact.attest(&secp, &secret);
        assert!(!compact.sufficiently_attested(&secp, &[known], 1));
    }

    #[test]
    fn forged_signatures_do_not_count() {
        let secp = Secp256k1::new();
        let (secret, public) = new_keypair(&secp, &mut rand::thread_rng());
        let mut compact = CompactTransaction::from_full(&sample_full_tx());
        // Signature over the wrong message.
        let signature = sign_hash(&secp, &secret, &Hash::digest(b"other"));
        compact.insert_attestation(public, signature);
        assert_eq!(compact.verified_attestation_count(&secp, &[public]), 0);
    }

    #[test]
    fn merge_is_monotonic() {
        let secp = Secp256k1::new();
        let (secret_a, _) = new_keypair(&secp, &mut rand::thread_rng());
        let (secret_b, _) = new_keypair(&secp, &mut rand::thread_rng());
        let mut one = CompactTransaction::from_full(&sample_full_tx());
        let mut two = one.clone();
        one.attest(&secp, &secret_a);
        two.attest(&secp, &secret_b);
        one.merge_attestations(&two.attestations);
        assert_eq!(one.attestations.len(), 2);
    }

    #[test]
    fn round_trips_with_attestations() {
        let secp = Secp256k1::new();
        let (secret, _) = new_keypair(&secp, &mut rand::thread_rng());
        let mut compact = CompactTransaction::from_full(&sample_full_tx());
        compact.attest(&secp, &secret);
        assert_eq!(CompactTransaction::decode(&compact.encode()).unwrap(), compact);
    }
}
