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

use rand::rngs::ThreadRng;
use secp256k1::{Keypair, Message, Secp256k1, Signing, Verification, XOnlyPublicKey};

use crate::Hash;

/// Define the explicit public key implementation for the engine. Witness
/// programs and sentinel identities commit to x-only keys.
pub type PublicKey = XOnlyPublicKey;

/// Define the explicit secret key implementation for the engine.
pub type SecretKey = secp256k1::SecretKey;

/// Define the explicit signature implementation for the engine: BIP-340
/// Schnorr over secp256k1.
pub type Signature = secp256k1::schnorr::Signature;

/// Context capability required to produce signatures.
pub type SignContext<C> = Secp256k1<C>;

/// Context capability required to verify signatures.
pub type VerifyContext<C> = Secp256k1<C>;

/// Generate a fresh random keypair.
pub fn new_keypair<C: Signing>(secp: &Secp256k1<C>, rng: &mut ThreadRng) -> (SecretKey, PublicKey) {
    let secret = SecretKey::new(rng);
    (secret, public_key_from_secret(secp, &secret))
}

/// Derive the x-only public key for a secret key.
pub fn public_key_from_secret<C: Signing>(secp: &Secp256k1<C>, secret: &SecretKey) -> PublicKey {
    let keypair = Keypair::from_secret_key(secp, secret);
    XOnlyPublicKey::from_keypair(&keypair).0
}

/// Build the signing keypair for a secret key.
pub fn keypair_from_secret<C: Signing>(secp: &Secp256k1<C>, secret: &SecretKey) -> Keypair {
    Keypair::from_secret_key(secp, secret)
}

/// Produce a BIP-340 signature over a 32-byte digest.
pub fn sign_hash<C: Signing>(secp: &Secp256k1<C>, secret: &SecretKey, hash: &Hash) -> Signature {
    let keypair = Keypair::from_secret_key(secp, secret);
    let msg = Message::from_digest(*hash.as_bytes());
    secp.sign_schnorr_no_aux_rand(&msg, &keypair)
}

/// Verify a BIP-340 signature over a 32-byte digest.
pub fn verify_hash<C: Verification>(
    secp: &Secp256k1<C>,
    public_key: &PublicKey,
    hash: &Hash,
    signature: &Signature,
) -> bool {
    let msg = Message::from_digest(*hash.as_bytes());
    secp.verify_schnorr(signature, &msg, public_key).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let secp = Secp256k1::new();
        let (secret, public) = new_keypair(&secp, &mut rand::thread_rng());
        let hash = Hash::digest(b"a payload");
        let sig = sign_hash(&secp, &secret, &hash);
        assert!(verify_hash(&secp, &public, &hash, &sig));
    }

    #[test]
    fn rejects_wrong_message() {
        let secp = Secp256k1::new();
        let (secret, public) = new_keypair(&secp, &mut rand::thread_rng());
        let sig = sign_hash(&secp, &secret, &Hash::digest(b"one"));
        assert!(!verify_hash(&secp, &public, &Hash::digest(b"two"), &sig));
    }

    #[test]
    fn rejects_wrong_key() {
        let secp = Secp256k1::new();
        let (secret, _) = new_keypair(&secp, &mut rand::thread_rng());
        let (_, other_public) = new_keypair(&secp, &mut rand::thread_rng());
        let hash = Hash::digest(b"a payload");
        let sig = sign_hash(&secp, &secret, &hash);
        assert!(!verify_hash(&secp, &other_public, &hash, &sig));
    }
}
