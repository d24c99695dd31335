//! Server-enforced validation rules for tunnel creation

use serde::Serialize;

use crate::presets::ServiceType;
use crate::tunnel::TunnelProtocol;

/// One rule violation, reported as `{path, msg}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub path: String,
    pub msg: String,
}

impl FieldError {
    fn new(path: &str, msg: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            msg: msg.into(),
        }
    }
}

/// Raw creation input as it arrives at the REST boundary.
#[derive(Debug, Clone)]
pub struct RawNewTunnel<'a> {
    pub subdomain: &'a str,
    pub region: &'a str,
    pub service_type: &'a str,
    pub protocol: Option<&'a str>,
    pub local_port: Option<u32>,
    pub remote_port: Option<u32>,
}

/// Validated creation input.
#[derive(Debug, Clone)]
pub struct ValidNewTunnel {
    pub subdomain: String,
    pub region: String,
    pub service_type: ServiceType,
    pub protocol: TunnelProtocol,
    pub local_port: u16,
    pub remote_port: Option<u16>,
}

pub fn subdomain_is_valid(subdomain: &str) -> bool {
    (3..=50).contains(&subdomain.len())
        && subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub fn region_is_valid(region: &str) -> bool {
    (2..=10).contains(&region.len())
}

pub fn token_is_valid(token: &str) -> bool {
    (32..=64).contains(&token.len())
}

fn port_in_range(port: u32) -> Option<u16> {
    if (1..=65535).contains(&port) {
        Some(port as u16)
    } else {
        None
    }
}

/// Validate creation input, collecting every violation.
///
/// The protocol defaults to the service type's; an HTTP tunnel must not
/// carry a remote port and a TCP/UDP tunnel gets one allocated later if
/// omitted. The local port defaults to the service preset.
pub fn validate_new_tunnel(raw: &RawNewTunnel<'_>) -> Result<ValidNewTunnel, Vec<FieldError>> {
    let mut errors = Vec::new();

    if !subdomain_is_valid(raw.subdomain) {
        errors.push(FieldError::new(
            "subdomain",
            "must be 3-50 characters of a-z, 0-9 or '-'",
        ));
    }

    if !region_is_valid(raw.region) {
        errors.push(FieldError::new("location", "must be 2-10 characters"));
    }

    let service_type = match ServiceType::parse(raw.service_type) {
        Some(ty) => Some(ty),
        None => {
            errors.push(FieldError::new(
                "service_type",
                format!("unknown service type '{}'", raw.service_type),
            ));
            None
        }
    };

    let protocol = match raw.protocol {
        Some(p) => match TunnelProtocol::parse(p) {
            Some(protocol) => Some(protocol),
            None => {
                errors.push(FieldError::new(
                    "protocol",
                    "must be one of: tcp, udp, http",
                ));
                None
            }
        },
        None => service_type.map(|ty| ty.default_protocol()),
    };

    let local_port = match raw.local_port {
        Some(port) => match port_in_range(port) {
            Some(port) => Some(port),
            None => {
                errors.push(FieldError::new("local_port", "must be between 1 and 65535"));
                None
            }
        },
        None => match service_type.and_then(|ty| ty.default_port()) {
            Some(port) => Some(port),
            None => {
                if service_type.is_some() {
                    errors.push(FieldError::new(
                        "local_port",
                        "required for the custom service type",
                    ));
                }
                None
            }
        },
    };

    let remote_port = match raw.remote_port {
        Some(port) => match port_in_range(port) {
            Some(port) => Some(Some(port)),
            None => {
                errors.push(FieldError::new(
                    "remote_port",
                    "must be between 1 and 65535",
                ));
                None
            }
        },
        None => Some(None),
    };

    if let (Some(protocol), Some(Some(_))) = (protocol, remote_port.as_ref()) {
        if protocol == TunnelProtocol::Http {
            errors.push(FieldError::new(
                "remote_port",
                "http tunnels are addressed by subdomain, not by port",
            ));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ValidNewTunnel {
        subdomain: raw.subdomain.to_string(),
        region: raw.region.to_string(),
        service_type: service_type.expect("validated"),
        protocol: protocol.expect("validated"),
        local_port: local_port.expect("validated"),
        remote_port: remote_port.expect("validated"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw<'a>() -> RawNewTunnel<'a> {
        RawNewTunnel {
            subdomain: "myapp",
            region: "id",
            service_type: "http",
            protocol: None,
            local_port: None,
            remote_port: None,
        }
    }

    #[test]
    fn test_valid_http_tunnel() {
        let valid = validate_new_tunnel(&raw()).unwrap();
        assert_eq!(valid.protocol, TunnelProtocol::Http);
        assert_eq!(valid.local_port, 80);
        assert_eq!(valid.remote_port, None);
    }

    #[test]
    fn test_subdomain_rules() {
        assert!(subdomain_is_valid("my-app-01"));
        assert!(!subdomain_is_valid("ab"));
        assert!(!subdomain_is_valid("MyApp"));
        assert!(!subdomain_is_valid("app_1"));
        assert!(!subdomain_is_valid(&"a".repeat(51)));
    }

    #[test]
    fn test_errors_are_collected_not_short_circuited() {
        let mut input = raw();
        input.subdomain = "A";
        input.region = "x";
        input.service_type = "gopher";

        let errors = validate_new_tunnel(&input).unwrap_err();
        let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"subdomain"));
        assert!(paths.contains(&"location"));
        assert!(paths.contains(&"service_type"));
    }

    #[test]
    fn test_http_rejects_remote_port() {
        let mut input = raw();
        input.remote_port = Some(13000);

        let errors = validate_new_tunnel(&input).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "remote_port");
    }

    #[test]
    fn test_custom_requires_local_port() {
        let mut input = raw();
        input.service_type = "custom";

        let errors = validate_new_tunnel(&input).unwrap_err();
        assert!(errors.iter().any(|e| e.path == "local_port"));

        input.local_port = Some(9000);
        let valid = validate_new_tunnel(&input).unwrap();
        assert_eq!(valid.protocol, TunnelProtocol::Tcp);
        assert_eq!(valid.local_port, 9000);
    }

    #[test]
    fn test_port_bounds() {
        let mut input = raw();
        input.service_type = "ssh";
        input.remote_port = Some(70000);

        let errors = validate_new_tunnel(&input).unwrap_err();
        assert!(errors.iter().any(|e| e.path == "remote_port"));
    }
}
