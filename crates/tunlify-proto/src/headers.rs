//! Header hygiene shared by the gateway ingress and the client relay
//!
//! Hop-by-hop and trust-sensitive headers are stripped in both directions;
//! multi-valued headers are flattened to a single comma-joined string in
//! header order before they hit the wire format's string map.

use std::collections::HashMap;

use http::HeaderMap;

/// Headers never forwarded through the tunnel, in either direction.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "x-forwarded-for",
    "x-real-ip",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-tunnel-subdomain",
    "x-tunnel-region",
    "server",
    "x-powered-by",
];

/// Whether a header must be stripped before crossing the tunnel.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Convert an [`http::HeaderMap`] into the wire map: hop-by-hop headers
/// stripped, empty values dropped, repeated headers comma-joined in order.
pub fn flatten_header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flattened: HashMap<String, String> = HashMap::new();

    for (name, value) in headers.iter() {
        let name_str = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&name_str) {
            continue;
        }

        let Ok(value_str) = value.to_str() else {
            continue;
        };
        if value_str.is_empty() {
            continue;
        }

        flattened
            .entry(name_str)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value_str);
            })
            .or_insert_with(|| value_str.to_string());
    }

    flattened
}

/// Apply the same hygiene to a header map that arrived over the wire.
pub fn sanitize_wire_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, value)| !is_hop_by_hop(name) && !value.is_empty())
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect()
}
