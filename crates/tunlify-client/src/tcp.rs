//! Local TCP stream shuttling
//!
//! One task per `connectionId`: dials the local target, acknowledges the
//! stream, then relays bytes in both directions with the same per-stream
//! ordering the gateway promises.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use tunlify_proto::ControlMessage;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Frames routed to one local stream from the control channel.
#[derive(Debug)]
pub enum LocalTcpEvent {
    Data(Vec<u8>),
    Close,
}

/// Run one logical TCP stream against the local target. `out` is the
/// control-channel send queue; `events` carries the gateway's frames for
/// this connection id.
pub async fn run_stream(
    connection_id: String,
    target_addr: String,
    out: mpsc::Sender<ControlMessage>,
    mut events: mpsc::Receiver<LocalTcpEvent>,
) {
    let mut socket = match TcpStream::connect(&target_addr).await {
        Ok(socket) => socket,
        Err(err) => {
            debug!(%connection_id, %target_addr, %err, "local connect failed");
            let _ = out
                .send(ControlMessage::TcpError {
                    connection_id,
                    message: err.to_string(),
                })
                .await;
            return;
        }
    };

    if out
        .send(ControlMessage::TcpConnectAck {
            connection_id: connection_id.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    let (mut read_half, mut write_half) = socket.split();

    // Local socket → gateway.
    let inbound = async {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = out
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
                    if out.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = out
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

    // Gateway → local socket. The sender disappearing (control channel
    // closed) ends the stream immediately.
    let outbound = async {
        while let Some(event) = events.recv().await {
            match event {
                LocalTcpEvent::Data(data) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                LocalTcpEvent::Close => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
    };

    tokio::join!(inbound, outbound);
    debug!("local tcp stream finished");
}
