//! Tunnel catalog
//!
//! The durable tunnel/token/port mapping behind the gateway, exposed as a
//! narrow async trait. The production deployment backs this with a real
//! database; [`MemoryCatalog`] is the default in-process implementation and
//! the one the test suite runs against.

pub mod memory;
pub mod ports;
pub mod presets;
pub mod store;
pub mod tunnel;
pub mod validate;

pub use memory::MemoryCatalog;
pub use ports::{allocate_remote_port, PortAllocError, MAX_PORT_PROBES, PORT_RANGE};
pub use presets::ServiceType;
pub use store::{CatalogError, CatalogStore, NewTunnel};
pub use tunnel::{generate_connection_token, Tunnel, TunnelKey, TunnelProtocol, TunnelStatus};
pub use validate::{validate_new_tunnel, FieldError, RawNewTunnel, ValidNewTunnel};
