//! Local UDP relaying
//!
//! One ephemeral socket per gateway session id, connected to the local
//! target. Replies arriving within the session window go back as
//! `udp_response` frames; idle sessions expire.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use tunlify_proto::ControlMessage;

const MAX_DATAGRAM: usize = 64 * 1024;
const DATAGRAM_QUEUE_DEPTH: usize = 64;

pub struct UdpRelay {
    target_addr: String,
    session_window: Duration,
    out: mpsc::Sender<ControlMessage>,
    sessions: DashMap<String, mpsc::Sender<Vec<u8>>>,
}

impl UdpRelay {
    pub fn new(
        target_addr: String,
        session_window: Duration,
        out: mpsc::Sender<ControlMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            target_addr,
            session_window,
            out,
            sessions: DashMap::new(),
        })
    }

    /// Relay one `udp_data` frame, creating the session on first use.
    pub async fn handle_datagram(self: &Arc<Self>, session_id: String, data: Vec<u8>) {
        let tx = self
            .sessions
            .get(&session_id)
            .map(|entry| entry.value().clone());

        let tx = match tx {
            Some(tx) => tx,
            None => self.open_session(session_id.clone()),
        };

        if let Err(returned) = tx.send(data).await {
            // The session task just expired; retry once with a new one.
            let tx = self.open_session(session_id);
            let _ = tx.send(returned.0).await;
        }
    }

    fn open_session(self: &Arc<Self>, session_id: String) -> mpsc::Sender<Vec<u8>> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(DATAGRAM_QUEUE_DEPTH);
        self.sessions.insert(session_id.clone(), tx.clone());

        let relay = self.clone();
        tokio::spawn(async move {
            relay.run_session(session_id, rx).await;
        });

        tx
    }

    async fn run_session(self: Arc<Self>, session_id: String, mut rx: mpsc::Receiver<Vec<u8>>) {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(err) => {
                debug!(%session_id, %err, "failed to bind udp session socket");
                self.sessions.remove(&session_id);
                return;
            }
        };
        if let Err(err) = socket.connect(&self.target_addr).await {
            debug!(%session_id, target = %self.target_addr, %err, "udp connect failed");
            self.sessions.remove(&session_id);
            return;
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(data) => {
                        if let Err(err) = socket.send(&data).await {
                            debug!(%session_id, %err, "udp send to local target failed");
                            break;
                        }
                    }
                    // Control channel gone; abort immediately.
                    None => break,
                },
                reply = socket.recv(&mut buf) => match reply {
                    Ok(len) => {
                        let frame = ControlMessage::UdpResponse {
                            session_id: session_id.clone(),
                            data: buf[..len].to_vec(),
                        };
                        if self.out.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(%session_id, %err, "udp recv from local target failed");
                        break;
                    }
                },
                _ = tokio::time::sleep(self.session_window) => {
                    debug!(%session_id, "udp session expired");
                    break;
                }
            }
        }

        self.sessions.remove(&session_id);
    }

    /// Drop every session; their tasks exit on the closed queues.
    pub fn shutdown(&self) {
        self.sessions.clear();
    }
}
