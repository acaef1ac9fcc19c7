use std::io;
use std::net::IpAddr;

use systemstat::{Platform, System};
use tracing_subscriber::EnvFilter;

/// Pick an IPv4 address that can be shared with the remote ICE agent.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. The first routable interface is
/// returned.
pub fn select_host_address() -> io::Result<IpAddr> {
    let system = System::new();
    let networks = system.networks()?;

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    return Ok(IpAddr::V4(v));
                }
            }
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "found no usable network interface",
    ))
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// of `pixel_bridge=info,str0m=warn`.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pixel_bridge=info,str0m=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
