//! Tunlify control-channel protocol
//!
//! Defines the JSON text frames exchanged between the gateway and the
//! client relay, plus the header-hygiene rules both endpoints apply.

pub mod headers;
pub mod messages;

pub use headers::{flatten_header_map, is_hop_by_hop, sanitize_wire_headers};
pub use messages::{decode_body, encode_body, BodyEncoding, ControlMessage, FrameError};

/// Path of the control-channel upgrade endpoint.
pub const CONTROL_PATH: &str = "/ws/tunnel";

/// Connection tokens are 32 random bytes, hex-encoded.
pub const TOKEN_HEX_LEN: usize = 64;
