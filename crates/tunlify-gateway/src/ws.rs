//! Control-channel endpoint
//!
//! Serves the persistent session at `/ws/tunnel?token=…`. A session is
//! authenticated exactly once, at upgrade time, against the catalog; a bad
//! or missing token closes the socket with a policy-violation code and no
//! further interaction. After auth the session owns the channel's writer
//! task, the per-tunnel L4 listeners, and the cleanup that runs when the
//! channel goes away for any reason.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tunlify_catalog::{validate, CatalogStore, Tunnel, TunnelProtocol, TunnelStatus};
use tunlify_proto::{ControlMessage, FrameError};

use crate::channel::{CloseReason, ControlChannel, TcpEvent};
use crate::pending::{ProxiedResponse, RequestFailure};
use crate::{tcp_ingress, udp_ingress, AppState};

#[derive(Debug, Deserialize)]
pub struct ControlQuery {
    token: Option<String>,
}

pub async fn control_channel_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ControlQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Authenticate before the upgrade completes; the session itself never
    // re-checks the token.
    let tunnel = match query.token {
        Some(ref token) if validate::token_is_valid(token) => {
            state.catalog.find_by_token(token).await.ok()
        }
        _ => None,
    };

    ws.on_upgrade(move |socket| run_session(state, socket, tunnel))
}

async fn run_session(state: Arc<AppState>, mut socket: WebSocket, tunnel: Option<Tunnel>) {
    let Some(tunnel) = tunnel else {
        warn!("control channel rejected: invalid or missing token");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: "invalid or missing token".into(),
            })))
            .await;
        return;
    };

    let key = tunnel.key();
    let (channel, queue_rx) = ControlChannel::new(
        tunnel.id.clone(),
        key.clone(),
        tunnel.user_id.clone(),
        state.config.send_queue_capacity,
    );

    info!(
        tunnel = %key,
        tunnel_id = %tunnel.id,
        user_id = %tunnel.user_id,
        channel_id = channel.channel_id(),
        "control channel authenticated"
    );

    if let Err(err) = state
        .catalog
        .update_status(&tunnel.id, TunnelStatus::Active, true, Some(Utc::now()))
        .await
    {
        warn!(tunnel = %key, %err, "failed to mark tunnel active");
    }

    state.registry.insert(channel.clone());

    // TCP/UDP tunnels own a public listener for the lifetime of the channel.
    let listener = spawn_l4_listener(&state, &tunnel, &channel);

    let public_url = state.public_url(&tunnel);
    if channel
        .try_send(ControlMessage::Connected {
            tunnel_id: tunnel.id.clone(),
            subdomain: tunnel.subdomain.clone(),
            region: tunnel.region.clone(),
            public_url,
        })
        .is_err()
    {
        warn!(tunnel = %key, "failed to enqueue connected frame");
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = spawn_writer(state.clone(), channel.clone(), ws_tx, queue_rx);

    // Read loop: every inbound frame refreshes liveness; the loop ends on
    // socket close, read error, or a close requested elsewhere (displaced,
    // evicted, deleted).
    loop {
        tokio::select! {
            _ = channel.closed() => break,
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    channel.touch();
                    dispatch_frame(&state, &channel, &text).await;
                }
                Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => {
                    channel.touch();
                }
                Some(Ok(Message::Binary(_))) => {
                    channel.touch();
                    warn!(tunnel = %key, "binary frame on control channel dropped");
                }
                Some(Ok(Message::Close(_))) | None => {
                    channel.close(CloseReason::PeerGone);
                    break;
                }
                Some(Err(err)) => {
                    debug!(tunnel = %key, %err, "control channel read error");
                    channel.close(CloseReason::PeerGone);
                    break;
                }
            }
        }
    }

    channel.close(CloseReason::PeerGone);
    let _ = writer.await;
    if let Some(listener) = listener {
        listener.abort();
    }

    cleanup(&state, &channel).await;
}

/// The channel's single writer: drains the send queue, emits server
/// heartbeats, and writes the close frame when the channel shuts down.
fn spawn_writer(
    state: Arc<AppState>,
    channel: Arc<ControlChannel>,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut queue_rx: mpsc::Receiver<ControlMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = channel.closed() => {
                    let code = channel
                        .close_reason()
                        .map(|reason| reason.close_code())
                        .unwrap_or(1000);
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
                queued = queue_rx.recv() => {
                    let Some(frame) = queued else { break };
                    match frame.to_wire() {
                        Ok(text) => {
                            if ws_tx.send(Message::Text(text)).await.is_err() {
                                channel.close(CloseReason::PeerGone);
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(tunnel = %channel.key, %err, "failed to encode frame");
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let Ok(text) = ControlMessage::Heartbeat.to_wire() else { continue };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        channel.close(CloseReason::PeerGone);
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_l4_listener(
    state: &Arc<AppState>,
    tunnel: &Tunnel,
    channel: &Arc<ControlChannel>,
) -> Option<JoinHandle<()>> {
    let port = tunnel.remote_port?;
    let state = state.clone();
    let channel = channel.clone();

    match tunnel.protocol {
        TunnelProtocol::Tcp => Some(tokio::spawn(async move {
            tcp_ingress::run_tcp_listener(state, channel, port).await;
        })),
        TunnelProtocol::Udp => Some(tokio::spawn(async move {
            udp_ingress::run_udp_listener(state, channel, port).await;
        })),
        TunnelProtocol::Http => None,
    }
}

/// Handle one client→server frame.
pub async fn dispatch_frame(state: &AppState, channel: &Arc<ControlChannel>, text: &str) {
    let msg = match ControlMessage::from_wire(text) {
        Ok(msg) => msg,
        Err(FrameError::Malformed(err)) => {
            warn!(tunnel = %channel.key, %err, "malformed control frame dropped");
            return;
        }
        Err(err) => {
            warn!(tunnel = %channel.key, %err, "undecodable control frame dropped");
            return;
        }
    };

    match msg {
        ControlMessage::Response {
            request_id,
            status_code,
            headers,
            encoding,
            body,
        } => {
            channel.note_response_received();
            state.pending.complete(
                &request_id,
                ProxiedResponse {
                    status_code,
                    headers,
                    encoding,
                    body,
                },
            );
        }
        ControlMessage::Error {
            request_id,
            message,
        } => {
            state
                .pending
                .fail(&request_id, RequestFailure::Upstream(message));
        }
        ControlMessage::Heartbeat => {
            let _ = channel.try_send(ControlMessage::HeartbeatAck);
        }
        ControlMessage::HeartbeatAck => {}
        ControlMessage::SetLocalAddress { address } => {
            info!(tunnel = %channel.key, local_address = %address, "client announced local target");
        }
        ControlMessage::TcpConnectAck { connection_id } => {
            route_tcp_event(channel, &connection_id, TcpEvent::Ack).await;
        }
        ControlMessage::TcpData {
            connection_id,
            data,
        } => {
            route_tcp_event(channel, &connection_id, TcpEvent::Data(data)).await;
        }
        ControlMessage::TcpClose { connection_id } => {
            route_tcp_event(channel, &connection_id, TcpEvent::Close).await;
        }
        ControlMessage::TcpError {
            connection_id,
            message,
        } => {
            route_tcp_event(channel, &connection_id, TcpEvent::Error(message)).await;
        }
        ControlMessage::UdpResponse { session_id, data } => {
            let reply = channel
                .udp_sessions
                .get(&session_id)
                .map(|entry| entry.value().clone());
            match reply {
                Some(reply) => {
                    let _ = reply.send(data).await;
                }
                None => {
                    debug!(tunnel = %channel.key, %session_id, "udp response for expired session");
                }
            }
        }
        ControlMessage::Unknown => {
            warn!(tunnel = %channel.key, "unknown control frame type dropped");
        }
        other => {
            warn!(tunnel = %channel.key, frame = ?other, "unexpected server-bound frame dropped");
        }
    }
}

async fn route_tcp_event(channel: &Arc<ControlChannel>, connection_id: &str, event: TcpEvent) {
    // Clone the sender out of the map; holding the shard lock across the
    // send would stall unrelated streams.
    let tx = channel
        .tcp_streams
        .get(connection_id)
        .map(|entry| entry.value().clone());

    match tx {
        Some(tx) => {
            if tx.send(event).await.is_err() {
                debug!(tunnel = %channel.key, connection_id, "tcp stream task gone");
            }
        }
        None => {
            debug!(tunnel = %channel.key, connection_id, "frame for unknown tcp stream dropped");
        }
    }
}

/// Exactly-once teardown after the session ends, in either direction.
async fn cleanup(state: &AppState, channel: &Arc<ControlChannel>) {
    let was_owner = state
        .registry
        .remove_if_current(&channel.key, channel.channel_id());
    let cancelled = state.pending.cancel_by_key(&channel.key);
    channel.teardown_streams();

    // A displaced channel must not clobber the catalog state its
    // replacement just wrote.
    if was_owner {
        if let Err(err) = state
            .catalog
            .update_status(&channel.tunnel_id, TunnelStatus::Inactive, false, None)
            .await
        {
            warn!(tunnel = %channel.key, %err, "failed to mark tunnel inactive");
        }
    }

    info!(
        tunnel = %channel.key,
        channel_id = channel.channel_id(),
        uptime_secs = channel.uptime().as_secs(),
        requests = channel.requests_sent(),
        responses = channel.responses_received(),
        cancelled_requests = cancelled,
        was_registry_owner = was_owner,
        "control channel closed"
    );
}
