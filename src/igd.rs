//! Gateway records shared by the protocol drivers and the coordinator.

use std::{
    fmt,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tracing::warn;

/// Fatal errors tolerated on one IGD before it is moved to invalid state.
pub const MAX_IGD_ERRORS: u32 = 10;

/// Protocol used to talk to an IGD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum NatProtocol {
    #[display("NAT-PMP")]
    NatPmp,
    #[display("UPNP")]
    Pupnp,
}

/// Lifecycle events reported by the drivers for an IGD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum IgdEvent {
    /// The IGD was discovered and validated.
    #[display("ADDED")]
    Added,
    /// The IGD disappeared from the network.
    #[display("REMOVED")]
    Removed,
    /// The IGD accumulated too many errors and was disabled.
    #[display("INVALID_STATE")]
    InvalidState,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Endpoints {
    local_ip: Option<Ipv4Addr>,
    public_ip: Option<Ipv4Addr>,
    uid: String,
}

/// A discovered Internet Gateway Device, regardless of protocol.
///
/// Validity and the error counter are atomics so the drivers can consult them
/// without going through the coordinator.
#[derive(Debug)]
pub struct Igd {
    protocol: NatProtocol,
    valid: AtomicBool,
    errors: AtomicU32,
    endpoints: Mutex<Endpoints>,
}

/// Shared handle to an [`Igd`]. Mappings keep only weak references to it.
pub type SharedIgd = Arc<Igd>;

impl Igd {
    pub fn new(protocol: NatProtocol) -> Self {
        Self {
            protocol,
            valid: AtomicBool::new(false),
            errors: AtomicU32::new(0),
            endpoints: Mutex::new(Endpoints::default()),
        }
    }

    pub fn shared(protocol: NatProtocol) -> SharedIgd {
        Arc::new(Self::new(protocol))
    }

    fn lock(&self) -> MutexGuard<'_, Endpoints> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn protocol(&self) -> NatProtocol {
        self.protocol
    }

    /// Address of the LAN side of the gateway.
    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.lock().local_ip
    }

    pub(crate) fn set_local_ip(&self, addr: Option<Ipv4Addr>) {
        self.lock().local_ip = addr;
    }

    /// Address of the WAN side of the gateway.
    pub fn public_ip(&self) -> Option<Ipv4Addr> {
        self.lock().public_ip
    }

    pub(crate) fn set_public_ip(&self, addr: Option<Ipv4Addr>) {
        self.lock().public_ip = addr;
    }

    /// Device identifier: the UDN-derived location for UPnP, a fixed string
    /// for NAT-PMP.
    pub fn uid(&self) -> String {
        self.lock().uid.clone()
    }

    pub(crate) fn set_uid(&self, uid: impl Into<String>) {
        self.lock().uid = uid.into();
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    /// Flip the validity. Marking an IGD valid resets its error counter.
    pub(crate) fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Relaxed);
        if valid {
            self.errors.store(0, Ordering::Relaxed);
        } else {
            warn!("IGD {self} [{}] was disabled", self.protocol);
        }
    }

    /// Record a fatal error against this IGD.
    ///
    /// Returns `false` once the counter reaches [`MAX_IGD_ERRORS`]; the
    /// counter latches there and the IGD is marked invalid.
    pub(crate) fn increment_errors(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        let errors = self.errors.fetch_add(1, Ordering::Relaxed) + 1;
        if errors >= MAX_IGD_ERRORS {
            warn!(
                "IGD {self} [{}] has too many errors, it will be disabled",
                self.protocol
            );
            self.set_valid(false);
            self.errors.store(MAX_IGD_ERRORS, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn errors_count(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }
}

impl PartialEq for Igd {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.protocol == other.protocol && *self.lock() == *other.lock()
    }
}

impl Eq for Igd {}

impl fmt::Display for Igd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoints = self.lock();
        match (endpoints.local_ip, endpoints.public_ip) {
            (Some(local), Some(public)) => write!(f, "{local} (public {public})"),
            (Some(local), None) => write!(f, "{local}"),
            _ => write!(f, "<unknown>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_latch_and_invalidate() {
        let igd = Igd::new(NatProtocol::NatPmp);
        igd.set_valid(true);

        for _ in 0..MAX_IGD_ERRORS - 1 {
            assert!(igd.increment_errors());
        }
        assert!(igd.is_valid());
        assert_eq!(igd.errors_count(), MAX_IGD_ERRORS - 1);

        // the tenth error flips the IGD to invalid
        assert!(!igd.increment_errors());
        assert!(!igd.is_valid());
        assert_eq!(igd.errors_count(), MAX_IGD_ERRORS);

        // further errors are no-ops on an invalid IGD
        assert!(!igd.increment_errors());
        assert_eq!(igd.errors_count(), MAX_IGD_ERRORS);
    }

    #[test]
    fn revalidation_resets_the_counter() {
        let igd = Igd::new(NatProtocol::Pupnp);
        igd.set_valid(true);
        assert!(igd.increment_errors());
        assert!(igd.errors_count() > 0);

        igd.set_valid(true);
        assert_eq!(igd.errors_count(), 0);
    }

    #[test]
    fn equality_is_on_endpoints_and_uid() {
        let a = Igd::new(NatProtocol::NatPmp);
        a.set_local_ip(Some(Ipv4Addr::new(192, 168, 1, 1)));
        a.set_public_ip(Some(Ipv4Addr::new(203, 0, 113, 7)));
        a.set_uid("NAT-PMP Gateway");

        let b = Igd::new(NatProtocol::NatPmp);
        b.set_local_ip(Some(Ipv4Addr::new(192, 168, 1, 1)));
        b.set_public_ip(Some(Ipv4Addr::new(203, 0, 113, 7)));
        b.set_uid("NAT-PMP Gateway");

        assert_eq!(a, b);

        b.set_uid("http://192.168.1.1:5000/rootDesc.xml");
        assert_ne!(a, b);

        // validity does not participate in identity
        a.set_valid(true);
        b.set_uid("NAT-PMP Gateway");
        assert_eq!(a, b);
    }
}
