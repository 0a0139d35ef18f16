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

//! Length-prefixed message transport: a request/response RPC server and
//! client with request-id multiplexing, and a one-to-many broadcast channel
//! used for block distribution. Payloads are values in the canonical wire
//! encoding.

use std::{
    collections::HashMap,
    marker::PhantomData,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use log::*;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, Semaphore},
    task::JoinHandle,
};
use tokio_util::{
    bytes::Bytes,
    codec::{Framed, LengthDelimitedCodec},
};

use crate::codec::{CodecError, Decode, Encode};

const LOG_TARGET: &str = "c::network";

/// Per-connection bound on requests being handled concurrently. Requests
/// beyond the bound wait in the socket buffer, which the peer observes as
/// backpressure and eventually a timeout.
const MAX_IN_FLIGHT_REQUESTS: usize = 256;

/// Queue depth for broadcast subscribers. A subscriber that falls this far
/// behind is disconnected rather than allowed to stall the publisher.
const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single frame. Blocks and aggregate notifications can
/// carry a full batch of transactions.
const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Request timed out")]
    Timeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Malformed message: {0}")]
    Codec(#[from] CodecError),
    #[error("Malformed frame: missing request id")]
    MalformedFrame,
}

impl NetworkError {
    /// Whether the caller may retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetworkError::Timeout | NetworkError::ConnectionClosed | NetworkError::Io(_)
        )
    }
}

/// Handle to a running RPC server.
pub struct RpcServerHandle {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RpcServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections. Established connections drain on
    /// their own.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Serve request/response RPC on `addr`. Each inbound frame is decoded as a
/// `Req`, dispatched to `handler` and the returned `Res` is written back
/// under the same request id. Requests on a connection are handled
/// concurrently up to [`MAX_IN_FLIGHT_REQUESTS`].
pub async fn serve<Req, Res, H, Fut>(addr: &str, handler: H) -> Result<RpcServerHandle, NetworkError>
where
    Req: Decode + Send + 'static,
    Res: Encode + Send + 'static,
    H: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Res> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    debug!(target: LOG_TARGET, "RPC server listening on {}", local_addr);

    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    trace!(target: LOG_TARGET, "Accepted connection from {}", peer);
                    tokio::spawn(serve_connection(stream, handler.clone()));
                },
                Err(e) => {
                    warn!(target: LOG_TARGET, "Accept failed: {}", e);
                },
            }
        }
    });

    Ok(RpcServerHandle {
        local_addr,
        accept_task,
    })
}

async fn serve_connection<Req, Res, H, Fut>(stream: TcpStream, handler: H)
where
    Req: Decode + Send + 'static,
    Res: Encode + Send + 'static,
    H: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Res> + Send + 'static,
{
    let framed = Framed::new(stream, frame_codec());
    let (mut sink, mut frames) = framed.split();

    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(MAX_IN_FLIGHT_REQUESTS);
    let writer = tokio::spawn(async move {
        while let Some(frame) = write_rx.recv().await {
            if sink.send(Bytes::from(frame)).await.is_err() {
                break;
            }
        }
    });

    let in_flight = Arc::new(Semaphore::new(MAX_IN_FLIGHT_REQUESTS));
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                trace!(target: LOG_TARGET, "Connection read error: {}", e);
                break;
            },
        };
        let (request_id, request) = match split_frame::<Req>(&frame) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(target: LOG_TARGET, "Dropping malformed request frame: {}", e);
                continue;
            },
        };
        let permit = match in_flight.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let handler = handler.clone();
        let write_tx = write_tx.clone();
        tokio::spawn(async move {
            let response = handler(request).await;
            let _ = write_tx.send(join_frame(request_id, &response)).await;
            drop(permit);
        });
    }

    writer.abort();
}

fn split_frame<T: Decode>(frame: &[u8]) -> Result<(u64, T), NetworkError> {
    if frame.len() < 8 {
        return Err(NetworkError::MalformedFrame);
    }
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&frame[..8]);
    let value = T::decode(&frame[8..])?;
    Ok((u64::from_le_bytes(id_bytes), value))
}

fn join_frame<T: Encode>(request_id: u64, value: &T) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.extend_from_slice(&request_id.to_le_bytes());
    value.encode_into(&mut frame);
    frame
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>>;

struct ClientConn {
    write_tx: mpsc::Sender<Vec<u8>>,
    pending: PendingMap,
    read_task: JoinHandle<()>,
}

impl Drop for ClientConn {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

/// RPC client with request-id multiplexing: many calls may be outstanding on
/// the one connection. Connects lazily and reconnects once per call after a
/// transport failure.
pub struct RpcClient<Req, Res> {
    endpoint: String,
    timeout: Duration,
    next_id: AtomicU64,
    conn: tokio::sync::Mutex<Option<ClientConn>>,
    _request: PhantomData<fn(Req) -> Res>,
}

impl<Req, Res> RpcClient<Req, Res>
where
    Req: Encode + Send + Sync,
    Res: Decode + Send,
{
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            next_id: AtomicU64::new(0),
            conn: tokio::sync::Mutex::new(None),
            _request: PhantomData,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send a request and await the matching response, reconnecting and
    /// retrying once if the connection failed.
    pub async fn call(&self, request: &Req) -> Result<Res, NetworkError> {
        match self.call_once(request).await {
            Err(e) if e.is_transient() && !matches!(e, NetworkError::Timeout) => {
                trace!(
                    target: LOG_TARGET,
                    "Retrying request to {} after transport error: {}",
                    self.endpoint,
                    e
                );
                self.call_once(request).await
            },
            other => other,
        }
    }

    async fn call_once(&self, request: &Req) -> Result<Res, NetworkError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut conn = self.conn.lock().await;
            if conn.is_none() {
                *conn = Some(self.connect().await?);
            }
            let conn_ref = conn.as_ref().map(|c| (c.write_tx.clone(), c.pending.clone()));
            let (write_tx, pending) = conn_ref.ok_or(NetworkError::ConnectionClosed)?;
            pending
                .lock()
                .map_err(|_| NetworkError::ConnectionClosed)?
                .insert(request_id, reply_tx);
            if write_tx.send(join_frame(request_id, request)).await.is_err() {
                *conn = None;
                return Err(NetworkError::ConnectionClosed);
            }
        }

        let payload = match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => {
                *self.conn.lock().await = None;
                return Err(NetworkError::ConnectionClosed);
            },
            Err(_) => {
                // Drop the pending entry so a late response is discarded.
                if let Some(conn) = self.conn.lock().await.as_ref() {
                    if let Ok(mut pending) = conn.pending.lock() {
                        pending.remove(&request_id);
                    }
                }
                return Err(NetworkError::Timeout);
            },
        };
        Ok(Res::decode(&payload)?)
    }

    async fn connect(&self) -> Result<ClientConn, NetworkError> {
        let stream = TcpStream::connect(&self.endpoint).await?;
        let framed = Framed::new(stream, frame_codec());
        let (mut sink, mut frames) = framed.split();

        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(MAX_IN_FLIGHT_REQUESTS);
        tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if sink.send(Bytes::from(frame)).await.is_err() {
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let read_pending = pending.clone();
        let read_task = tokio::spawn(async move {
            while let Some(Ok(frame)) = frames.next().await {
                if frame.len() < 8 {
                    continue;
                }
                let mut id_bytes = [0u8; 8];
                id_bytes.copy_from_slice(&frame[..8]);
                let request_id = u64::from_le_bytes(id_bytes);
                let reply = read_pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&request_id));
                if let Some(reply) = reply {
                    let _ = reply.send(frame[8..].to_vec());
                }
            }
            // Connection gone: fail everything still outstanding.
            if let Ok(mut pending) = read_pending.lock() {
                pending.clear();
            }
        });

        Ok(ClientConn {
            write_tx,
            pending,
            read_task,
        })
    }
}

/// One-to-many publisher. Subscribers connect over TCP and receive every
/// message broadcast after they join.
pub struct Broadcaster {
    local_addr: SocketAddr,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>>,
    accept_task: JoinHandle<()>,
}

impl Broadcaster {
    pub async fn bind(addr: &str) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let subscribers: Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_subscribers = subscribers.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        trace!(target: LOG_TARGET, "Subscriber connected from {}", peer);
                        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SUBSCRIBER_QUEUE_DEPTH);
                        if let Ok(mut subs) = accept_subscribers.lock() {
                            subs.push(tx);
                        }
                        tokio::spawn(async move {
                            let mut framed = Framed::new(stream, frame_codec());
                            while let Some(frame) = rx.recv().await {
                                if framed.send(Bytes::from(frame)).await.is_err() {
                                    break;
                                }
                            }
                        });
                    },
                    Err(e) => {
                        warn!(target: LOG_TARGET, "Subscriber accept failed: {}", e);
                    },
                }
            }
        });

        Ok(Self {
            local_addr,
            subscribers,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a message to every connected subscriber. Subscribers whose
    /// queues are full are disconnected.
    pub fn broadcast<T: Encode>(&self, message: &T) {
        let frame = message.encode();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.try_send(frame.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Receiving end of a [`Broadcaster`] stream.
pub struct Subscriber<T> {
    frames: futures::stream::SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
    _message: PhantomData<fn() -> T>,
}

impl<T: Decode> Subscriber<T> {
    pub async fn connect(endpoint: &str) -> Result<Self, NetworkError> {
        let stream = TcpStream::connect(endpoint).await?;
        let framed = Framed::new(stream, frame_codec());
        let (_sink, frames) = framed.split();
        Ok(Self {
            frames,
            _message: PhantomData,
        })
    }

    /// Await the next broadcast message.
    pub async fn recv(&mut self) -> Result<T, NetworkError> {
        let frame = self
            .frames
            .next()
            .await
            .ok_or(NetworkError::ConnectionClosed)??;
        Ok(T::decode(&frame)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn request_response_round_trip() {
        let server = serve("127.0.0.1:0", |req: u64| async move { req * 2 }).await.unwrap();
        let client = RpcClient::<u64, u64>::new(server.local_addr().to_string());
        assert_eq!(client.call(&21).await.unwrap(), 42);
        assert_eq!(client.call(&5).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn concurrent_calls_are_multiplexed() {
        let server = serve("127.0.0.1:0", |req: u64| async move {
            // Later requests complete first.
            tokio::time::sleep(Duration::from_millis(50u64.saturating_sub(req * 10))).await;
            req
        })
        .await
        .unwrap();
        let client = Arc::new(RpcClient::<u64, u64>::new(server.local_addr().to_string()));
        let calls: Vec<_> = (0..5u64)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move { client.call(&i).await.unwrap() })
            })
            .collect();
        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap(), i as u64);
        }
    }

    #[tokio::test]
    async fn call_times_out_when_unreachable() {
        let client =
            RpcClient::<u64, u64>::new("127.0.0.1:1".to_string()).with_timeout(Duration::from_millis(100));
        let err = client.call(&1).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers() {
        let broadcaster = Broadcaster::bind("127.0.0.1:0").await.unwrap();
        let addr = broadcaster.local_addr().to_string();
        let mut sub_a = Subscriber::<u64>::connect(&addr).await.unwrap();
        let mut sub_b = Subscriber::<u64>::connect(&addr).await.unwrap();

        // Wait for the accept loop to register both subscribers.
        while broadcaster.subscriber_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        broadcaster.broadcast(&7u64);
        assert_eq!(sub_a.recv().await.unwrap(), 7);
        assert_eq!(sub_b.recv().await.unwrap(), 7);
    }
}
