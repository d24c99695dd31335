//! Local target parsing
//!
//! Accepted forms: `host:port`, `:port`, `port`, `http://host:port/…`,
//! `https://host:port/…`. A URL form fixes the local scheme; the bare
//! forms default to plain TCP for tcp/udp tunnels and to HTTP for http
//! tunnels.

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("unparseable local target '{0}'")]
    Invalid(String),

    #[error("unsupported scheme '{0}' (use http:// or https://)")]
    UnsupportedScheme(String),

    #[error("local target '{0}' has no port")]
    MissingPort(String),
}

/// How the relay talks to the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScheme {
    /// Raw bytes over TCP (also used as the destination for UDP tunnels).
    Tcp,
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub scheme: TargetScheme,
    pub host: String,
    pub port: u16,
}

impl LocalTarget {
    /// Parse a target string. `default_scheme` applies to the bare forms
    /// only; URL forms carry their own.
    pub fn parse(input: &str, default_scheme: TargetScheme) -> Result<Self, TargetError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TargetError::Invalid(input.to_string()));
        }

        if input.contains("://") {
            return Self::parse_url(input);
        }

        // Bare port: `8080`
        if let Ok(port) = input.parse::<u16>() {
            if port == 0 {
                return Err(TargetError::Invalid(input.to_string()));
            }
            return Ok(Self {
                scheme: default_scheme,
                host: "127.0.0.1".to_string(),
                port,
            });
        }

        // `host:port` or `:port`
        let Some((host, port)) = input.rsplit_once(':') else {
            return Err(TargetError::Invalid(input.to_string()));
        };
        let port: u16 = port
            .parse()
            .map_err(|_| TargetError::Invalid(input.to_string()))?;
        if port == 0 {
            return Err(TargetError::Invalid(input.to_string()));
        }

        let host = if host.is_empty() {
            "127.0.0.1".to_string()
        } else {
            host.to_string()
        };

        Ok(Self {
            scheme: default_scheme,
            host,
            port,
        })
    }

    fn parse_url(input: &str) -> Result<Self, TargetError> {
        let url = Url::parse(input).map_err(|_| TargetError::Invalid(input.to_string()))?;

        let scheme = match url.scheme() {
            "http" => TargetScheme::Http,
            "https" => TargetScheme::Https,
            other => return Err(TargetError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| TargetError::Invalid(input.to_string()))?
            .to_string();

        let port = url
            .port_or_known_default()
            .ok_or_else(|| TargetError::MissingPort(input.to_string()))?;

        Ok(Self { scheme, host, port })
    }

    /// `host:port` form for dialing.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.scheme {
            TargetScheme::Tcp => write!(f, "{}", self.authority()),
            TargetScheme::Http => write!(f, "http://{}", self.authority()),
            TargetScheme::Https => write!(f, "https://{}", self.authority()),
        }
    }
}
