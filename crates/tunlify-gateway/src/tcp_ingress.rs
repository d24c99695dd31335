//! TCP ingress
//!
//! One listener per active TCP tunnel, bound on the tunnel's allocated
//! remote port for exactly as long as its control channel lives. Every
//! accepted socket becomes a logical stream on the channel: `tcp_connect`,
//! then byte shuttling as `tcp_data` frames in both directions. Bytes are
//! ordered within a stream only; the single-writer send queue is what
//! guarantees a `tcp_close` is observed after all prior `tcp_data`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tunlify_proto::ControlMessage;

use crate::channel::{ControlChannel, TcpEvent};
use crate::AppState;

const READ_BUF_SIZE: usize = 16 * 1024;
const EVENT_QUEUE_DEPTH: usize = 64;

/// Accept loop for one tunnel's public TCP port. Returns when the control
/// channel closes or the bind fails.
pub async fn run_tcp_listener(state: Arc<AppState>, channel: Arc<ControlChannel>, port: u16) {
    let bind_addr = SocketAddr::new(state.config.l4_bind_ip, port);

    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(tunnel = %channel.key, %bind_addr, %err, "failed to bind tcp listener");
            return;
        }
    };

    info!(tunnel = %channel.key, %bind_addr, "tcp listener up");

    loop {
        tokio::select! {
            _ = channel.closed() => break,
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(tunnel = %channel.key, %err, "tcp accept failed");
                        continue;
                    }
                };

                let state = state.clone();
                let channel = channel.clone();
                tokio::spawn(async move {
                    handle_connection(state, channel, socket, peer).await;
                });
            }
        }
    }

    info!(tunnel = %channel.key, %bind_addr, "tcp listener down");
}

async fn handle_connection(
    state: Arc<AppState>,
    channel: Arc<ControlChannel>,
    mut socket: TcpStream,
    peer: SocketAddr,
) {
    let connection_id = Uuid::new_v4().to_string();
    debug!(tunnel = %channel.key, %peer, %connection_id, "tcp connection accepted");

    let (events_tx, mut events_rx) = mpsc::channel::<TcpEvent>(EVENT_QUEUE_DEPTH);
    channel.tcp_streams.insert(connection_id.clone(), events_tx);

    let opened = open_stream(&state, &channel, &connection_id, &mut events_rx).await;
    if !opened {
        channel.tcp_streams.remove(&connection_id);
        return;
    }

    let (mut read_half, mut write_half) = socket.split();

    // Ingress socket → control channel. Awaiting the bounded send queue is
    // the backpressure: a saturated channel pauses these reads.
    let inbound = async {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = channel
                        .send(ControlMessage::TcpClose {
                            connection_id: connection_id.clone(),
                        })
                        .await;
                    break;
                }
                Ok(n) => {
                    let frame = ControlMessage::TcpData {
                        connection_id: connection_id.clone(),
                        data: buf[..n].to_vec(),
                    };
                    if channel.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(connection_id = %connection_id, %err, "tcp read failed");
                    let _ = channel
                        .send(ControlMessage::TcpError {
                            connection_id: connection_id.clone(),
                            message: err.to_string(),
                        })
                        .await;
                    break;
                }
            }
        }
    };

    // Control channel → ingress socket.
    let outbound = async {
        while let Some(event) = events_rx.recv().await {
            match event {
                TcpEvent::Data(data) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                TcpEvent::Close => {
                    let _ = write_half.shutdown().await;
                    break;
                }
                TcpEvent::Error(message) => {
                    debug!(connection_id = %connection_id, %message, "tcp stream aborted by client");
                    break;
                }
                TcpEvent::Ack => {
                    warn!(connection_id = %connection_id, "duplicate tcp_connect_ack ignored");
                }
            }
        }
    };

    tokio::join!(inbound, outbound);

    channel.tcp_streams.remove(&connection_id);
    debug!(tunnel = %channel.key, %connection_id, "tcp connection finished");
}

/// Send `tcp_connect` and wait for the client's verdict.
async fn open_stream(
    state: &AppState,
    channel: &Arc<ControlChannel>,
    connection_id: &str,
    events_rx: &mut mpsc::Receiver<TcpEvent>,
) -> bool {
    let frame = ControlMessage::TcpConnect {
        connection_id: connection_id.to_string(),
    };
    if channel.send(frame).await.is_err() {
        return false;
    }

    match tokio::time::timeout(state.config.connect_ack_timeout, events_rx.recv()).await {
        Ok(Some(TcpEvent::Ack)) => true,
        Ok(Some(TcpEvent::Error(message))) => {
            debug!(connection_id, %message, "client failed to reach local endpoint");
            false
        }
        Ok(Some(TcpEvent::Close)) | Ok(None) => false,
        Ok(Some(TcpEvent::Data(_))) => {
            // Data before the ack violates the stream contract.
            warn!(connection_id, "tcp_data before tcp_connect_ack, aborting stream");
            false
        }
        Err(_elapsed) => {
            warn!(connection_id, "timed out waiting for tcp_connect_ack");
            let _ = channel
                .send(ControlMessage::TcpClose {
                    connection_id: connection_id.to_string(),
                })
                .await;
            false
        }
    }
}
