// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Server half of a connection: handshake verification and dispatch of
//! decoded requests onto a local [`Peer`].

use crate::{
    peer::Peer,
    transport::{framed, recv_frame, send_frame},
    wire::{HandshakeRequest, HandshakeResponse, RpcRequest, RpcResponse},
};
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use torus_config::NetworkConfig;
use torus_types::{Error, ProtocolVersion};
use tracing::{debug, trace};

/// Serves one inbound connection until the stream closes. The returned
/// handle may be aborted to drop the session.
pub fn serve<T>(
    io: T,
    service: Arc<dyn Peer>,
    protocol: ProtocolVersion,
    config: &NetworkConfig,
) -> JoinHandle<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = config.clone();
    tokio::spawn(async move {
        let mut framed = framed(io, &config);
        let handshake: HandshakeRequest = match recv_frame(&mut framed).await {
            Ok(handshake) => handshake,
            Err(_) => return,
        };
        let authenticated = handshake.authenticates();
        let negotiated = protocol.min(handshake.protocol);
        debug!(
            peer = %handshake.node_id,
            protocol = %negotiated,
            authenticated,
            "inbound session"
        );
        let response =
            HandshakeResponse { protocol: negotiated, node_id: service.id() };
        if send_frame(&mut framed, &response).await.is_err() {
            return;
        }
        loop {
            let request: RpcRequest = match recv_frame(&mut framed).await {
                Ok(request) => request,
                Err(_) => return,
            };
            trace!(peer = %handshake.node_id, method = request.method(), "rpc");
            let response =
                dispatch(&*service, request, authenticated, negotiated).await;
            if send_frame(&mut framed, &response).await.is_err() {
                return;
            }
        }
    })
}

async fn dispatch(
    service: &dyn Peer,
    request: RpcRequest,
    authenticated: bool,
    protocol: ProtocolVersion,
) -> RpcResponse {
    if request.mutates() && !authenticated {
        return RpcResponse::Err(Error::ValidationFailed(format!(
            "{} requires an authenticated session",
            request.method()
        )));
    }
    let result = match request {
        RpcRequest::Propose { quorum, address, proposal, insert } => {
            // Below 0.9 the insert flag does not exist on the wire and
            // every propose may create state.
            let insert = insert || !protocol.insert_flag();
            service
                .propose(&quorum, address, proposal, insert)
                .await
                .map(RpcResponse::Promise)
        },
        RpcRequest::Accept { quorum, address, proposal, value } => service
            .accept(&quorum, address, proposal, value)
            .await
            .map(RpcResponse::Proposal),
        RpcRequest::Confirm { quorum, address, proposal } => service
            .confirm(&quorum, address, proposal)
            .await
            .map(|()| RpcResponse::Unit),
        RpcRequest::Get { quorum, address, local_version } => service
            .get(&quorum, address, local_version)
            .await
            .map(RpcResponse::Get),
        RpcRequest::Store { block, mode } => {
            service.store(block, mode).await.map(|()| RpcResponse::Unit)
        },
        RpcRequest::Fetch { address, local_version } => {
            service.fetch(address, local_version).await.map(RpcResponse::Block)
        },
        RpcRequest::Remove { address, signature } => {
            service.remove(address, signature).await.map(|()| RpcResponse::Unit)
        },
        RpcRequest::Reconcile { address } => {
            service.reconcile(address).await.map(RpcResponse::Reconciled)
        },
        RpcRequest::Propagate { quorum, block, proposal } => {
            if !protocol.propagate_rpc() {
                Err(Error::UnknownRpc("propagate".into()))
            } else {
                service
                    .propagate(&quorum, block, proposal)
                    .await
                    .map(|()| RpcResponse::Unit)
            }
        },
    };
    result.unwrap_or_else(RpcResponse::Err)
}
