// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Channelled transport: bcs frames over any `AsyncRead + AsyncWrite`
//! byte stream, with one driver task per connection. RPCs on a
//! connection are issued strictly in order; fan-out parallelism lives at
//! the peer-set level, not the connection level.

use crate::wire::{decode, encode, HandshakeRequest, HandshakeResponse, RpcRequest, RpcResponse};
use bytes::Bytes;
use ed25519_dalek::Keypair;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use torus_config::NetworkConfig;
use torus_types::{Error, NodeId, ProtocolVersion};
use tracing::debug;

pub(crate) type FramedIo<T> = Framed<T, LengthDelimitedCodec>;

pub(crate) fn framed<T: AsyncRead + AsyncWrite>(
    io: T,
    config: &NetworkConfig,
) -> FramedIo<T> {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(config.max_frame_size);
    Framed::new(io, codec)
}

pub(crate) async fn send_frame<T, M>(
    framed: &mut FramedIo<T>,
    message: &M,
) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: serde::Serialize,
{
    let bytes = encode(message)?;
    framed
        .send(Bytes::from(bytes))
        .await
        .map_err(|e| Error::Unavailable(e.to_string()))
}

pub(crate) async fn recv_frame<T, M>(framed: &mut FramedIo<T>) -> Result<M, Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: for<'de> serde::Deserialize<'de>,
{
    match framed.next().await {
        Some(Ok(bytes)) => decode(&bytes),
        Some(Err(e)) => Err(Error::Unavailable(e.to_string())),
        None => Err(Error::Unavailable("connection closed".into())),
    }
}

type Pending = (RpcRequest, oneshot::Sender<Result<RpcResponse, Error>>);

/// Client half of an established session. Dropping the connection aborts
/// the driver, failing every in-flight RPC with `Unavailable`.
pub struct Connection {
    peer_id: NodeId,
    protocol: ProtocolVersion,
    requests: mpsc::Sender<Pending>,
    driver: JoinHandle<()>,
    rpc_timeout: Duration,
}

impl Connection {
    /// The remote node's identity, as announced in the handshake.
    pub fn peer_id(&self) -> NodeId {
        self.peer_id
    }

    /// The negotiated protocol version.
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Issues one RPC and awaits its reply. Transport failures and
    /// missed deadlines surface as `Unavailable`.
    pub async fn call(&self, request: RpcRequest) -> Result<RpcResponse, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send((request, reply_tx))
            .await
            .map_err(|_| Error::Unavailable("connection closed".into()))?;
        match timeout(self.rpc_timeout, reply_rx).await {
            Err(_) => Err(Error::Unavailable("rpc deadline exceeded".into())),
            Ok(Err(_)) => Err(Error::Unavailable("connection closed".into())),
            Ok(Ok(result)) => result?.into_result(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Establishes a session over `io`: sends the handshake, negotiates the
/// protocol version and spawns the connection driver.
pub async fn connect<T>(
    io: T,
    identity: &Keypair,
    protocol: ProtocolVersion,
    config: &NetworkConfig,
) -> Result<Connection, Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = framed(io, config);
    send_frame(&mut framed, &HandshakeRequest::new(identity, protocol)).await?;
    let response: HandshakeResponse = timeout(
        Duration::from_millis(config.connect_timeout_ms),
        recv_frame(&mut framed),
    )
    .await
    .map_err(|_| Error::Unavailable("handshake timed out".into()))??;
    let negotiated = protocol.min(response.protocol);
    debug!(
        peer = %response.node_id,
        protocol = %negotiated,
        "connection established"
    );
    let (requests, queue) = mpsc::channel(config.max_channel_size);
    let driver = tokio::spawn(drive(framed, queue));
    Ok(Connection {
        peer_id: response.node_id,
        protocol: negotiated,
        requests,
        driver,
        rpc_timeout: Duration::from_millis(config.rpc_timeout_ms),
    })
}

async fn drive<T>(mut framed: FramedIo<T>, mut queue: mpsc::Receiver<Pending>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    while let Some((request, reply)) = queue.recv().await {
        let result = match send_frame(&mut framed, &request).await {
            Ok(()) => recv_frame::<_, RpcResponse>(&mut framed).await,
            Err(e) => Err(e),
        };
        let failed = result.is_err();
        let _ = reply.send(result);
        if failed {
            break;
        }
    }
    // The stream is unusable; fail whatever is still queued.
    queue.close();
    while let Ok((_, reply)) = queue.try_recv() {
        let _ = reply.send(Err(Error::Unavailable("connection closed".into())));
    }
}
