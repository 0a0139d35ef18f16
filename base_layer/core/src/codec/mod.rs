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

//! Canonical wire encoding used by every RPC message in the system:
//! little-endian fixed-width scalars, sequences as a `u64` length followed by
//! the elements, variants as a `u8` tag then the payload, options as a `u8`
//! present-flag then the payload.

use std::collections::{BTreeMap, BTreeSet};

use cbdc_common_types::{Hash, PublicKey, Signature, HASH_SIZE};
use thiserror::Error;

/// Types that can be written to the canonical wire format.
pub trait Encode {
    fn encode_into(&self, buf: &mut Vec<u8>);

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }
}

/// Types that can be read back from the canonical wire format.
pub trait Decode: Sized {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError>;

    /// Decode a value that must consume the entire buffer.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let value = Self::decode_from(&mut reader)?;
        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes(reader.remaining()));
        }
        Ok(value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of buffer: wanted {wanted} more bytes, {available} available")]
    UnexpectedEof { wanted: usize, available: usize },
    #[error("Sequence length {0} exceeds remaining buffer")]
    LengthOverflow(u64),
    #[error("Unknown variant tag {tag} for {type_name}")]
    UnknownTag { tag: u8, type_name: &'static str },
    #[error("Invalid flag byte {0} for option")]
    InvalidFlag(u8),
    #[error("Invalid key or signature bytes: {0}")]
    InvalidCrypto(String),
    #[error("{0} trailing bytes after decoding")]
    TrailingBytes(usize),
}

/// Byte-slice reader tracking the decode position.
pub struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.bytes.len() < n {
            return Err(CodecError::UnexpectedEof {
                wanted: n,
                available: self.bytes.len(),
            });
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let slice = self.take(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(slice);
        Ok(arr)
    }

    /// Read a sequence length, rejecting lengths that cannot possibly fit in
    /// the remaining buffer.
    pub fn take_len(&mut self) -> Result<usize, CodecError> {
        let len = u64::decode_from(self)?;
        if len > self.remaining() as u64 {
            return Err(CodecError::LengthOverflow(len));
        }
        Ok(len as usize)
    }
}

macro_rules! impl_scalar_codec {
    ($ty:ty) => {
        impl Encode for $ty {
            fn encode_into(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_le_bytes());
            }
        }

        impl Decode for $ty {
            fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
                Ok(<$ty>::from_le_bytes(reader.take_array()?))
            }
        }
    };
}

impl_scalar_codec!(u8);
impl_scalar_codec!(u16);
impl_scalar_codec!(u32);
impl_scalar_codec!(u64);

impl Encode for bool {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(false),
            1 => Ok(true),
            flag => Err(CodecError::InvalidFlag(flag)),
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        (self.len() as u64).encode_into(buf);
        for item in self {
            item.encode_into(buf);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = reader.take_len()?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::decode_from(reader)?);
        }
        Ok(items)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Some(value) => {
                buf.push(1);
                value.encode_into(buf);
            },
            None => buf.push(0),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode_from(reader)?)),
            flag => Err(CodecError::InvalidFlag(flag)),
        }
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        (self.len() as u64).encode_into(buf);
        for (key, value) in self {
            key.encode_into(buf);
            value.encode_into(buf);
        }
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = reader.take_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let key = K::decode_from(reader)?;
            let value = V::decode_from(reader)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<T: Encode> Encode for BTreeSet<T> {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        (self.len() as u64).encode_into(buf);
        for item in self {
            item.encode_into(buf);
        }
    }
}

impl<T: Decode + Ord> Decode for BTreeSet<T> {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = reader.take_len()?;
        let mut set = BTreeSet::new();
        for _ in 0..len {
            set.insert(T::decode_from(reader)?);
        }
        Ok(set)
    }
}

impl Encode for () {
    fn encode_into(&self, _buf: &mut Vec<u8>) {}
}

impl Decode for () {
    fn decode_from(_reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(())
    }
}

impl<T: Encode, E: Encode> Encode for Result<T, E> {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Ok(value) => {
                buf.push(0);
                value.encode_into(buf);
            },
            Err(err) => {
                buf.push(1);
                err.encode_into(buf);
            },
        }
    }
}

impl<T: Decode, E: Decode> Decode for Result<T, E> {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(Ok(T::decode_from(reader)?)),
            1 => Ok(Err(E::decode_from(reader)?)),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "Result",
            }),
        }
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.0.encode_into(buf);
        self.1.encode_into(buf);
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let a = A::decode_from(reader)?;
        let b = B::decode_from(reader)?;
        Ok((a, b))
    }
}

impl Encode for Hash {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.as_bytes());
    }
}

impl Decode for Hash {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Hash::from_bytes(reader.take_array::<HASH_SIZE>()?))
    }
}

impl Encode for PublicKey {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.serialize());
    }
}

impl Decode for PublicKey {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let bytes = reader.take(32)?;
        PublicKey::from_slice(bytes).map_err(|e| CodecError::InvalidCrypto(e.to_string()))
    }
}

impl Encode for Signature {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self[..]);
    }
}

impl Decode for Signature {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let bytes = reader.take(64)?;
        Signature::from_slice(bytes).map_err(|e| CodecError::InvalidCrypto(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scalars_are_little_endian() {
        assert_eq!(0x0102_0304u32.encode(), vec![0x04, 0x03, 0x02, 0x01]);
        assert_eq!(1u64.encode(), vec![1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn sequences_are_u64_length_prefixed() {
        let v: Vec<u8> = vec![7, 8];
        let encoded = v.encode();
        assert_eq!(&encoded[..8], &2u64.to_le_bytes());
        assert_eq!(&encoded[8..], &[7, 8]);
        assert_eq!(Vec::<u8>::decode(&encoded).unwrap(), v);
    }

    #[test]
    fn options_are_flag_prefixed() {
        assert_eq!(Option::<u8>::None.encode(), vec![0]);
        assert_eq!(Some(5u8).encode(), vec![1, 5]);
        assert_eq!(Option::<u8>::decode(&[1, 5]).unwrap(), Some(5));
        assert!(Option::<u8>::decode(&[2]).is_err());
    }

    #[test]
    fn maps_round_trip() {
        let mut map = BTreeMap::new();
        map.insert(3u64, 30u64);
        map.insert(1u64, 10u64);
        let decoded = BTreeMap::<u64, u64>::decode(&map.encode()).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn hash_round_trips() {
        let h = Hash::digest(b"codec");
        assert_eq!(Hash::decode(&h.encode()).unwrap(), h);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let encoded = 7u64.encode();
        assert!(matches!(
            u64::decode(&encoded[..4]),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut encoded = Vec::new();
        u64::MAX.encode_into(&mut encoded);
        assert!(matches!(
            Vec::<u64>::decode(&encoded),
            Err(CodecError::LengthOverflow(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = 1u8.encode();
        encoded.push(0);
        assert!(matches!(u8::decode(&encoded), Err(CodecError::TrailingBytes(1))));
    }

    #[test]
    fn signature_and_key_round_trip() {
        let secp = secp256k1::Secp256k1::new();
        let (secret, public) = cbdc_common_types::new_keypair(&secp, &mut rand::thread_rng());
        let sig = cbdc_common_types::sign_hash(&secp, &secret, &Hash::digest(b"x"));
        assert_eq!(PublicKey::decode(&public.encode()).unwrap(), public);
        assert_eq!(Signature::decode(&sig.encode()).unwrap(), sig);
    }
}
