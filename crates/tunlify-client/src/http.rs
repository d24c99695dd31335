//! Local HTTP forwarding
//!
//! Forwards `request` frames to the local HTTP server with a small pool of
//! hyper http/1.1 connections, then classifies the response body as text
//! or binary for the return frame.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use regex::Regex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use tunlify_proto::{decode_body, encode_body, sanitize_wire_headers, BodyEncoding};

use crate::target::{LocalTarget, TargetScheme};

const MAX_POOL_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to {target}: {source}")]
    ConnectionFailed {
        target: String,
        source: std::io::Error,
    },

    #[error("https local target {0} is not supported; point the relay at the plain-http port")]
    TlsUnsupported(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("failed to read response body: {0}")]
    ResponseBody(String),
}

/// Response payload ready to go back over the control channel.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub encoding: BodyEncoding,
    pub body: String,
}

pub struct HttpForwarder {
    target: LocalTarget,
    pool: Mutex<Vec<http1::SendRequest<Full<Bytes>>>>,
    binary_types: Regex,
}

impl HttpForwarder {
    pub fn new(target: LocalTarget) -> Arc<Self> {
        Arc::new(Self {
            target,
            pool: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
            binary_types: Regex::new("image|video|audio|octet-stream|pdf")
                .expect("static pattern"),
        })
    }

    /// Whether a content type should be relayed as base64.
    pub fn is_binary(&self, content_type: &str) -> bool {
        self.binary_types.is_match(&content_type.to_ascii_lowercase())
    }

    async fn get_connection(&self) -> Result<http1::SendRequest<Full<Bytes>>, ForwardError> {
        // The dialer speaks plain http/1.1; refuse an https target rather
        // than silently downgrading it.
        if self.target.scheme == TargetScheme::Https {
            return Err(ForwardError::TlsUnsupported(self.target.authority()));
        }

        {
            let mut pool = self.pool.lock().await;
            while let Some(sender) = pool.pop() {
                if sender.is_ready() {
                    return Ok(sender);
                }
            }
        }

        let authority = self.target.authority();
        let stream =
            TcpStream::connect(&authority)
                .await
                .map_err(|source| ForwardError::ConnectionFailed {
                    target: authority.clone(),
                    source,
                })?;

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| ForwardError::RequestFailed(err.to_string()))?;

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(%err, "local http connection closed");
            }
        });

        Ok(sender)
    }

    async fn return_connection(&self, sender: http1::SendRequest<Full<Bytes>>) {
        if !sender.is_ready() {
            return;
        }
        let mut pool = self.pool.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(sender);
        }
    }

    /// Forward one proxied request to the local endpoint.
    pub async fn forward(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> Result<ForwardedResponse, ForwardError> {
        let method: Method = method
            .parse()
            .map_err(|_| ForwardError::InvalidRequest(format!("bad method '{}'", method)))?;
        let uri: Uri = url
            .parse()
            .map_err(|_| ForwardError::InvalidRequest(format!("bad url '{}'", url)))?;

        let body_bytes = match body {
            Some(encoded) => decode_body(encoded)
                .map_err(|err| ForwardError::InvalidRequest(err.to_string()))?,
            None => Vec::new(),
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            // hyper does not add Host for http/1.1 requests built manually.
            .header("host", self.target.authority());

        for (name, value) in sanitize_wire_headers(headers) {
            builder = builder.header(name, value);
        }

        let request = builder
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|err| ForwardError::InvalidRequest(err.to_string()))?;

        let mut sender = self.get_connection().await?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|err| ForwardError::RequestFailed(err.to_string()))?;
        self.return_connection(sender).await;

        let status = response.status().as_u16();

        let mut out_headers: HashMap<String, String> = HashMap::new();
        let mut content_type = String::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else { continue };
            let name = name.as_str().to_ascii_lowercase();
            if name == "content-type" {
                content_type = value.to_string();
            }
            out_headers.insert(name, value.to_string());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| ForwardError::ResponseBody(err.to_string()))?
            .to_bytes();

        let (encoding, body) = if self.is_binary(&content_type) {
            (BodyEncoding::Base64, encode_body(&body))
        } else {
            // A nominally-text body that is not valid UTF-8 still has to
            // survive the trip byte-for-byte.
            match String::from_utf8(body.to_vec()) {
                Ok(text) => (BodyEncoding::Utf8, text),
                Err(_) => (BodyEncoding::Base64, encode_body(&body)),
            }
        };

        Ok(ForwardedResponse {
            status,
            headers: out_headers,
            encoding,
            body,
        })
    }

    /// Pre-flight reachability probe: any TCP-level success counts, whatever
    /// status the local server answers with.
    pub async fn preflight(&self) -> Result<(), ForwardError> {
        match self.forward("GET", "/", &HashMap::new(), None).await {
            Ok(_) => Ok(()),
            Err(
                err @ (ForwardError::ConnectionFailed { .. } | ForwardError::TlsUnsupported(_)),
            ) => Err(err),
            // The endpoint answered something; it is reachable.
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetScheme;

    fn forwarder() -> Arc<HttpForwarder> {
        HttpForwarder::new(LocalTarget {
            scheme: TargetScheme::Http,
            host: "127.0.0.1".to_string(),
            port: 80,
        })
    }

    #[tokio::test]
    async fn test_https_target_is_rejected() {
        let forwarder = HttpForwarder::new(LocalTarget {
            scheme: TargetScheme::Https,
            host: "127.0.0.1".to_string(),
            port: 8443,
        });

        let err = forwarder
            .forward("GET", "/", &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::TlsUnsupported(_)));

        // The pre-flight must fail too, not report the target reachable.
        assert!(matches!(
            forwarder.preflight().await,
            Err(ForwardError::TlsUnsupported(_))
        ));
    }

    #[test]
    fn test_binary_classification() {
        let fwd = forwarder();
        assert!(fwd.is_binary("image/png"));
        assert!(fwd.is_binary("video/mp4"));
        assert!(fwd.is_binary("audio/ogg"));
        assert!(fwd.is_binary("application/octet-stream"));
        assert!(fwd.is_binary("application/pdf"));
        assert!(fwd.is_binary("IMAGE/JPEG"));

        assert!(!fwd.is_binary("text/html; charset=utf-8"));
        assert!(!fwd.is_binary("application/json"));
        assert!(!fwd.is_binary(""));
    }
}
