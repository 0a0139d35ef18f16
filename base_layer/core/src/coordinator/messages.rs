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

use async_trait::async_trait;

use crate::{
    codec::{CodecError, Decode, Encode, Reader},
    network::RpcClient,
    transactions::CompactTransaction,
};

/// Wire requests served by the coordinator endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorRequest {
    Execute(CompactTransaction),
}

/// `Some(committed)` is a decision; `None` means the coordinator hit an
/// internal error and the client should retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorResponse(pub Option<bool>);

impl Encode for CoordinatorRequest {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            CoordinatorRequest::Execute(tx) => {
                buf.push(0);
                tx.encode_into(buf);
            },
        }
    }
}

impl Decode for CoordinatorRequest {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        match u8::decode_from(reader)? {
            0 => Ok(CoordinatorRequest::Execute(CompactTransaction::decode_from(reader)?)),
            tag => Err(CodecError::UnknownTag {
                tag,
                type_name: "CoordinatorRequest",
            }),
        }
    }
}

impl Encode for CoordinatorResponse {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        self.0.encode_into(buf);
    }
}

impl Decode for CoordinatorResponse {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self(Option::decode_from(reader)?))
    }
}

/// How sentinels and clients submit transactions for settlement. `None`
/// means no decision was reached (transient failure, retry-eligible).
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn execute(&self, tx: CompactTransaction) -> Option<bool>;
}

/// RPC-backed coordinator client.
pub struct RemoteCoordinator {
    client: RpcClient<CoordinatorRequest, CoordinatorResponse>,
}

impl RemoteCoordinator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: RpcClient::new(endpoint),
        }
    }
}

#[async_trait]
impl CoordinatorClient for RemoteCoordinator {
    async fn execute(&self, tx: CompactTransaction) -> Option<bool> {
        match self.client.call(&CoordinatorRequest::Execute(tx)).await {
            Ok(CoordinatorResponse(decision)) => decision,
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use cbdc_common_types::Hash;

    use super::*;

    #[test]
    fn messages_round_trip() {
        let request = CoordinatorRequest::Execute(CompactTransaction {
            tx_id: Hash::digest(b"tx"),
            inputs: vec![Hash::digest(b"in")],
            outputs: vec![Hash::digest(b"out")],
            attestations: Default::default(),
        });
        assert_eq!(CoordinatorRequest::decode(&request.encode()).unwrap(), request);

        for response in [
            CoordinatorResponse(Some(true)),
            CoordinatorResponse(Some(false)),
            CoordinatorResponse(None),
        ] {
            assert_eq!(CoordinatorResponse::decode(&response.encode()).unwrap(), response);
        }
    }
}
