//! Tunlify client relay
//!
//! Runs next to the origin service. Holds the outbound control channel to
//! the gateway, dials the local endpoint for every proxied request, stream
//! or datagram, and relays bytes back.

pub mod http;
pub mod relay;
pub mod target;
pub mod tcp;
pub mod udp;

pub use relay::{ClientRelay, RelayConfig, RelayError, RelayMode};
pub use target::{LocalTarget, TargetError, TargetScheme};
