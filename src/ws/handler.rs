//! WebSocket upgrade handler and session loop

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::ProxyState;
use crate::ws::protocol::{ChannelFrame, SKIN_CHANNEL};
use crate::ws::ClientHandle;

/// Query parameters for WebSocket connection
///
/// The username stands in for the session identity the outer proxy's auth
/// layer would normally establish.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub username: String,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ProxyState>,
) -> Response {
    let ip = peer.ip().to_string();

    // Gate the upgrade itself before any session state exists
    if !state.limiters.ws.consume(&ip, 1).is_allowed()
        || !state.limiters.connect.consume(&ip, 1).is_allowed()
    {
        info!(addr = %peer, "WebSocket upgrade rate-limited");
        return Response::builder()
            .status(429)
            .body("Too Many Requests".into())
            .unwrap();
    }

    info!(username = %query.username, addr = %peer, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, query.username, peer, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, username: String, peer: SocketAddr, state: ProxyState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<ChannelFrame>(32);
    let client = ClientHandle::new(username.clone(), peer.ip(), out_tx);

    // Writer task: queued frames -> WebSocket
    let writer_username = username.clone();
    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let encoded = frame.encode();
            if let Err(e) = ws_sink.send(Message::Binary(encoded.to_vec())).await {
                debug!(username = %writer_username, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    // Reader loop: WebSocket -> channel routing
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Binary(raw)) => {
                let frame = match ChannelFrame::decode(raw.into()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(username = %username, error = %e, "Malformed channel frame");
                        continue;
                    }
                };

                match frame.channel.as_str() {
                    SKIN_CHANNEL => {
                        // Protocol errors are fatal to the request only
                        if let Err(e) = state.skins.handle_request(frame, &client).await {
                            warn!(username = %username, error = %e, "Skin request rejected");
                        }
                    }
                    other => {
                        debug!(username = %username, channel = other, "Frame on unrouted channel");
                    }
                }
            }
            Ok(Message::Text(_)) => {
                warn!(username = %username, "Received text message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(username = %username, "Client initiated close");
                break;
            }
            Err(e) => {
                debug!(username = %username, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
    info!(username = %username, "WebSocket connection closed");
}
