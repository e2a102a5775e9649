//! WebSocket Handler
//!
//! Admission happens here, before the upgrade: an address already at its
//! connection ceiling gets a 429 and never reaches the actor.

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;

use super::actor::ConnectionActor;
use crate::governor::client_address;
use crate::server::{AppState, ServerError};

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let address = client_address(&headers, peer.map(|ConnectInfo(addr)| addr));

    let Some(guard) = state.governor.try_admit(&address) else {
        tracing::warn!(address = %address, "Connection ceiling reached, rejecting upgrade");
        return ServerError::TooManyConnections(address).into_response();
    };

    let actor = ConnectionActor::new(
        Arc::clone(&state.hub),
        Arc::clone(&state.governor),
        Arc::clone(&state.handler),
        address,
    );

    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        actor.run(stream, sink).await;
        // Released only once both loops are done
        drop(guard);
    })
}
