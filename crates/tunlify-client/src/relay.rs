//! Control-channel client
//!
//! Owns the persistent session at `wss://{api-host}/ws/tunnel?token=…` and
//! dispatches every inbound frame to the right local worker. On any
//! disconnect the relay aborts all in-flight local work, waits five
//! seconds, and reconnects; it retries indefinitely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use tunlify_proto::{ControlMessage, FrameError, CONTROL_PATH};

use crate::http::{ForwardError, HttpForwarder};
use crate::target::{LocalTarget, TargetScheme};
use crate::tcp::LocalTcpEvent;
use crate::udp::UdpRelay;

const SEND_QUEUE_DEPTH: usize = 256;

/// What kind of tunnel this relay serves; decides how frames are handled
/// and what the bare target forms default to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RelayMode {
    Http,
    Tcp,
    Udp,
}

impl RelayMode {
    pub fn default_target_scheme(&self) -> TargetScheme {
        match self {
            RelayMode::Http => TargetScheme::Http,
            RelayMode::Tcp | RelayMode::Udp => TargetScheme::Tcp,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("local endpoint unreachable: {0}")]
    Preflight(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `wss://api.tunlify.net` (the control path is appended).
    pub server_url: String,
    pub connection_token: String,
    pub target: LocalTarget,
    pub mode: RelayMode,
    pub reconnect_delay: Duration,
    pub udp_session_window: Duration,
}

impl RelayConfig {
    fn control_url(&self) -> String {
        format!(
            "{}{}?token={}",
            self.server_url.trim_end_matches('/'),
            CONTROL_PATH,
            self.connection_token
        )
    }
}

/// Everything one connected session owns. Dropped (and aborted) wholesale
/// on disconnect so no local work outlives the control channel.
struct Session {
    out: mpsc::Sender<ControlMessage>,
    http: Arc<HttpForwarder>,
    udp: Arc<UdpRelay>,
    tcp_streams: DashMap<String, mpsc::Sender<LocalTcpEvent>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    fn new(config: &RelayConfig, out: mpsc::Sender<ControlMessage>) -> Arc<Self> {
        Arc::new(Self {
            out: out.clone(),
            http: HttpForwarder::new(config.target.clone()),
            udp: UdpRelay::new(
                config.target.authority(),
                config.udp_session_window,
                out,
            ),
            tcp_streams: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    async fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Abort all in-flight local work immediately.
    async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.tcp_streams.clear();
        self.udp.shutdown();
    }
}

pub struct ClientRelay {
    config: RelayConfig,
}

impl ClientRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    /// Pre-flight the local endpoint. HTTP mode issues a short GET where
    /// any TCP-level success counts; TCP mode opens a socket; UDP skips.
    pub async fn preflight(&self) -> Result<(), RelayError> {
        match self.config.mode {
            RelayMode::Http => {
                let forwarder = HttpForwarder::new(self.config.target.clone());
                forwarder
                    .preflight()
                    .await
                    .map_err(|err| RelayError::Preflight(err.to_string()))
            }
            RelayMode::Tcp => TcpStream::connect(self.config.target.authority())
                .await
                .map(|_| ())
                .map_err(|err| RelayError::Preflight(err.to_string())),
            RelayMode::Udp => Ok(()),
        }
    }

    /// Run forever: connect, serve the session, reconnect after the delay.
    pub async fn run(&self) -> Result<(), RelayError> {
        loop {
            match self.run_session().await {
                Ok(()) => info!("control channel closed by server"),
                Err(err) => warn!(%err, "control channel failed"),
            }

            info!(
                delay_secs = self.config.reconnect_delay.as_secs(),
                "reconnecting"
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn run_session(&self) -> Result<(), RelayError> {
        let url = self.config.control_url();
        info!(target = %self.config.target, "connecting control channel");

        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(SEND_QUEUE_DEPTH);
        let session = Session::new(&self.config, out_tx.clone());

        // Single writer: everything going to the gateway funnels through
        // the queue, so frames for one stream keep their order and the
        // read loop below can never wedge itself behind a socket write.
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match frame.to_wire() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(%err, "failed to encode frame");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        // Advisory only; the server just logs it.
        let _ = out_tx
            .send(ControlMessage::SetLocalAddress {
                address: self.config.target.to_string(),
            })
            .await;

        let result: Result<(), RelayError> = loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.dispatch(&session, &text).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server closed control channel");
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break Err(RelayError::WebSocket(err)),
                None => break Ok(()),
            }
        };

        session.shutdown().await;
        writer.abort();
        result
    }

    async fn dispatch(&self, session: &Arc<Session>, text: &str) {
        let msg = match ControlMessage::from_wire(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, "malformed frame from server dropped");
                return;
            }
        };

        match msg {
            ControlMessage::Connected {
                subdomain,
                region,
                public_url,
                ..
            } => {
                info!(%subdomain, %region, %public_url, "tunnel is live");
            }
            ControlMessage::Request {
                request_id,
                method,
                url,
                headers,
                body,
            } => {
                let session_clone = session.clone();
                let handle = tokio::spawn(async move {
                    handle_request(&session_clone, request_id, method, url, headers, body).await;
                });
                session.track(handle).await;
            }
            ControlMessage::TcpConnect { connection_id } => {
                self.open_tcp_stream(session, connection_id).await;
            }
            ControlMessage::TcpData {
                connection_id,
                data,
            } => {
                route_tcp_event(session, &connection_id, LocalTcpEvent::Data(data)).await;
            }
            ControlMessage::TcpClose { connection_id } => {
                route_tcp_event(session, &connection_id, LocalTcpEvent::Close).await;
                session.tcp_streams.remove(&connection_id);
            }
            ControlMessage::TcpError {
                connection_id,
                message,
            } => {
                debug!(%connection_id, %message, "gateway aborted tcp stream");
                session.tcp_streams.remove(&connection_id);
            }
            ControlMessage::UdpData {
                session_id, data, ..
            } => {
                session.udp.handle_datagram(session_id, data).await;
            }
            ControlMessage::Heartbeat => {
                let _ = session.out.send(ControlMessage::HeartbeatAck).await;
            }
            ControlMessage::HeartbeatAck => {}
            ControlMessage::Unknown => {
                warn!("unknown frame type from server dropped");
            }
            other => {
                warn!(frame = ?other, "unexpected client-bound frame dropped");
            }
        }
    }

    async fn open_tcp_stream(&self, session: &Arc<Session>, connection_id: String) {
        let (events_tx, events_rx) = mpsc::channel::<LocalTcpEvent>(64);
        session
            .tcp_streams
            .insert(connection_id.clone(), events_tx);

        let out = session.out.clone();
        let target = self.config.target.authority();
        let session_ref = session.clone();
        let id = connection_id.clone();
        let handle = tokio::spawn(async move {
            crate::tcp::run_stream(id.clone(), target, out, events_rx).await;
            session_ref.tcp_streams.remove(&id);
        });
        session.track(handle).await;
    }
}

async fn route_tcp_event(session: &Arc<Session>, connection_id: &str, event: LocalTcpEvent) {
    let tx = session
        .tcp_streams
        .get(connection_id)
        .map(|entry| entry.value().clone());

    match tx {
        Some(tx) => {
            let _ = tx.send(event).await;
        }
        None => {
            debug!(connection_id, "frame for unknown local tcp stream dropped");
        }
    }
}

/// Forward one HTTP request and answer with exactly one `response` or
/// `error` frame for its request id.
async fn handle_request(
    session: &Session,
    request_id: String,
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: Option<String>,
) {
    debug!(%request_id, %method, %url, "forwarding to local endpoint");

    let frame = match session
        .http
        .forward(&method, &url, &headers, body.as_deref())
        .await
    {
        Ok(response) => ControlMessage::Response {
            request_id,
            status_code: Some(response.status),
            headers: response.headers,
            encoding: response.encoding,
            body: response.body,
        },
        Err(err) => {
            let message = match err {
                ForwardError::ConnectionFailed { target, .. } => {
                    format!("local endpoint {} is unreachable", target)
                }
                other => other.to_string(),
            };
            ControlMessage::Error {
                request_id,
                message,
            }
        }
    };

    let _ = session.out.send(frame).await;
}
