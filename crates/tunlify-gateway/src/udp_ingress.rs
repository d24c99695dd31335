//! UDP ingress
//!
//! One datagram socket per active UDP tunnel. Datagrams have no
//! connection; each remote `(ip, port)` gets a session id that is reused
//! for the session window so `udp_response` frames can route back, then
//! swept after inactivity.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tunlify_proto::ControlMessage;

use crate::channel::ControlChannel;
use crate::AppState;

const MAX_DATAGRAM: usize = 64 * 1024;
const REPLY_QUEUE_DEPTH: usize = 64;

struct Session {
    id: String,
    last_seen: Instant,
}

/// Receive loop for one tunnel's public UDP port. Returns when the control
/// channel closes or the bind fails.
pub async fn run_udp_listener(state: Arc<AppState>, channel: Arc<ControlChannel>, port: u16) {
    let bind_addr = SocketAddr::new(state.config.l4_bind_ip, port);

    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => Arc::new(socket),
        Err(err) => {
            error!(tunnel = %channel.key, %bind_addr, %err, "failed to bind udp listener");
            return;
        }
    };

    info!(tunnel = %channel.key, %bind_addr, "udp listener up");

    let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
    let mut sweep = tokio::time::interval(state.config.udp_session_timeout / 4);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = channel.closed() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(tunnel = %channel.key, %err, "udp recv failed");
                        continue;
                    }
                };

                let session_id = match sessions.get_mut(&peer) {
                    Some(session) => {
                        session.last_seen = Instant::now();
                        session.id.clone()
                    }
                    None => {
                        let id = Uuid::new_v4().to_string();
                        sessions.insert(
                            peer,
                            Session { id: id.clone(), last_seen: Instant::now() },
                        );
                        spawn_reply_task(&channel, &socket, &id, peer);
                        debug!(tunnel = %channel.key, %peer, session_id = %id, "udp session opened");
                        id
                    }
                };

                let frame = ControlMessage::UdpData {
                    session_id,
                    data: buf[..len].to_vec(),
                    source_addr: peer.to_string(),
                };
                if channel.send(frame).await.is_err() {
                    break;
                }
            }
            _ = sweep.tick() => {
                let timeout = state.config.udp_session_timeout;
                sessions.retain(|peer, session| {
                    let live = session.last_seen.elapsed() < timeout;
                    if !live {
                        debug!(tunnel = %channel.key, %peer, session_id = %session.id, "udp session expired");
                        channel.udp_sessions.remove(&session.id);
                    }
                    live
                });
            }
        }
    }

    for session in sessions.values() {
        channel.udp_sessions.remove(&session.id);
    }

    info!(tunnel = %channel.key, %bind_addr, "udp listener down");
}

/// Per-session task writing `udp_response` payloads back to the session's
/// remote address. Ends when the session is swept (its sender is dropped).
fn spawn_reply_task(
    channel: &Arc<ControlChannel>,
    socket: &Arc<UdpSocket>,
    session_id: &str,
    peer: SocketAddr,
) {
    let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(REPLY_QUEUE_DEPTH);
    channel.udp_sessions.insert(session_id.to_string(), reply_tx);

    let socket = socket.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        while let Some(payload) = reply_rx.recv().await {
            if let Err(err) = socket.send_to(&payload, peer).await {
                debug!(session_id = %session_id, %peer, %err, "udp reply send failed");
                break;
            }
        }
    });
}
