//! Remote-port allocation for TCP/UDP tunnels
//!
//! The allocator is a stateless probe loop; the real atomicity lives in the
//! store's `(region, remote_port)` uniqueness invariant at insert time. On
//! an insert conflict the caller simply allocates again.

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::store::{CatalogError, CatalogStore};

/// Ports handed out to tunnels without a user-supplied port.
pub const PORT_RANGE: std::ops::RangeInclusive<u16> = 10000..=60000;

/// Random probes before giving up.
pub const MAX_PORT_PROBES: usize = 20;

#[derive(Debug, Error)]
pub enum PortAllocError {
    #[error("port {port} is already taken in region '{region}'")]
    Taken { region: String, port: u16 },

    #[error("no free port found in {:?} after {} probes", PORT_RANGE, MAX_PORT_PROBES)]
    Exhausted,

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Pick a remote port for `region`.
///
/// A user-supplied port is only checked for uniqueness. Otherwise random
/// ports in [`PORT_RANGE`] are probed until one is free, up to
/// [`MAX_PORT_PROBES`] attempts.
pub async fn allocate_remote_port(
    catalog: &dyn CatalogStore,
    region: &str,
    requested: Option<u16>,
) -> Result<u16, PortAllocError> {
    if let Some(port) = requested {
        if catalog.is_port_free(region, port).await? {
            return Ok(port);
        }
        return Err(PortAllocError::Taken {
            region: region.to_string(),
            port,
        });
    }

    for attempt in 1..=MAX_PORT_PROBES {
        let port = rand::thread_rng().gen_range(PORT_RANGE);
        if catalog.is_port_free(region, port).await? {
            debug!(region, port, attempt, "allocated remote port");
            return Ok(port);
        }
    }

    Err(PortAllocError::Exhausted)
}
