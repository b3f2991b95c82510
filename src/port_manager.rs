use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::{debug, warn};

/// How many successive slots to try before giving up on finding a free port.
const MAX_PROBE_SLOTS: u16 = 64;

/// Configuration for per-test port allocation
#[derive(Debug, Clone)]
pub struct PortAllocatorConfig {
    /// Address the launched servers bind to
    pub bind_address: IpAddr,
    /// Base port of the environment
    pub base_port: u16,
    /// Fixed gap between the base port and the first test's port
    pub port_offset: u16,
    /// Gap between the ports of consecutive tests
    pub port_stride: u16,
    /// Skip ports that are already bound on the host
    pub probe_availability: bool,
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            base_port: 7777,
            port_offset: 10,
            port_stride: 10,
            probe_availability: true,
        }
    }
}

/// Hands out server ports: base port + fixed offset + a per-test offset that
/// only ever increases, so concurrent tests never share a port.
///
/// Shared between orchestrators behind an `Arc`.
#[derive(Debug)]
pub struct PortAllocator {
    config: PortAllocatorConfig,
    next_slot: AtomicU16,
}

impl PortAllocator {
    pub fn new(config: PortAllocatorConfig) -> Self {
        Self { config, next_slot: AtomicU16::new(0) }
    }

    /// Allocates the next port. Returns `None` when the port range is exhausted.
    pub fn allocate(&self) -> Option<u16> {
        for _ in 0..MAX_PROBE_SLOTS {
            let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
            let port = self.port_for_slot(slot)?;

            if !self.config.probe_availability || self.is_port_free(port) {
                debug!("Allocated port {} (slot {})", port, slot);
                return Some(port);
            }

            warn!("Port {} is in use, skipping", port);
        }

        None
    }

    /// The port a given slot maps to, if it fits in the port range.
    pub fn port_for_slot(&self, slot: u16) -> Option<u16> {
        let step = u32::from(self.config.port_stride.max(1)) * u32::from(slot);
        let port = u32::from(self.config.base_port) + u32::from(self.config.port_offset) + step;
        u16::try_from(port).ok()
    }

    pub fn bind_address(&self) -> IpAddr {
        self.config.bind_address
    }

    /// Probes whether both the TCP and UDP port can be bound right now.
    pub fn is_port_free(&self, port: u16) -> bool {
        let addr = SocketAddr::new(self.config.bind_address, port);
        probe(addr, Type::STREAM, Protocol::TCP) && probe(addr, Type::DGRAM, Protocol::UDP)
    }
}

fn probe(addr: SocketAddr, ty: Type, protocol: Protocol) -> bool {
    let domain = match addr.ip() {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };

    let socket = match Socket::new(domain, ty, Some(protocol)) {
        Ok(socket) => socket,
        Err(_) => return false,
    };

    if socket.set_reuse_address(true).is_err() {
        return false;
    }

    socket.bind(&addr.into()).is_ok()
}
