//! Port mapping records shared between the coordinator and the protocol drivers.

use std::{
    fmt,
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::igd::{Igd, NatProtocol, SharedIgd};

/// Prefix of the description attached to every mapping created by this crate.
///
/// The prune logic relies on it to tell locally-owned mappings apart from
/// third-party ones, so it must stay stable across versions.
pub const MAPPING_DESCRIPTION_PREFIX: &str = "JAMI";

/// Key identifying a mapping within the coordinator table.
///
/// Low 16 bits hold the internal port, bit 16 is set for UDP.
pub type MapKey = u64;

const KEY_FAMILY_BIT: MapKey = 1 << u16::BITS;

/// Callback used to report mapping state changes to the consumer that
/// reserved it.
///
/// Invoked from the coordinator task, never while internal locks are held.
/// Remove notifications are best-effort and may be reported for removals the
/// coordinator initiated itself, so implementations must be idempotent.
pub type NotifyCallback = Arc<dyn Fn(SharedMapping) + Send + Sync + 'static>;

/// Transport family of a mapping.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    Serialize,
    Deserialize,
)]
pub enum PortFamily {
    #[display("TCP")]
    Tcp,
    #[display("UDP")]
    Udp,
}

impl PortFamily {
    /// Index used by the per-family tables and limits, TCP first.
    pub(crate) const fn index(&self) -> usize {
        match self {
            PortFamily::Tcp => 0,
            PortFamily::Udp => 1,
        }
    }

    /// Family encoded in a mapping key.
    pub fn from_key(key: MapKey) -> Self {
        if key & KEY_FAMILY_BIT != 0 {
            PortFamily::Udp
        } else {
            PortFamily::Tcp
        }
    }
}

/// State of a mapping as observed by its consumer.
///
/// All driver-level errors collapse into [`MappingState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MappingState {
    #[display("PENDING")]
    Pending,
    #[display("IN_PROGRESS")]
    InProgress,
    #[display("FAILED")]
    Failed,
    #[display("OPEN")]
    Open,
}

/// A mapping shared between the coordinator table and its consumer.
pub type SharedMapping = Arc<Mapping>;

/// One requested or granted port reservation.
///
/// The fields are guarded by an internal lock so the record can be read from
/// any thread; mutations happen only on the coordinator task.
pub struct Mapping {
    family: PortFamily,
    fields: Mutex<Fields>,
}

struct Fields {
    external_port: u16,
    internal_port: u16,
    internal_addr: Option<Ipv4Addr>,
    // Non-owning back reference, the coordinator owns the IGD lifetime.
    igd: Weak<Igd>,
    available: bool,
    auto_update: bool,
    state: MappingState,
    notify: Option<NotifyCallback>,
    // NAT-PMP only, next renewal deadline.
    renewal_time: Instant,
}

impl Mapping {
    /// Create a new reservation in [`MappingState::Pending`] state.
    pub fn new(family: PortFamily, external_port: u16, internal_port: u16, available: bool) -> Self {
        Self {
            family,
            fields: Mutex::new(Fields {
                external_port,
                internal_port,
                internal_addr: None,
                igd: Weak::new(),
                available,
                auto_update: false,
                state: MappingState::Pending,
                notify: None,
                renewal_time: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Fields> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn family(&self) -> PortFamily {
        self.family
    }

    pub fn external_port(&self) -> u16 {
        self.lock().external_port
    }

    pub(crate) fn set_external_port(&self, port: u16) {
        self.lock().external_port = port;
    }

    pub fn internal_port(&self) -> u16 {
        self.lock().internal_port
    }

    pub(crate) fn set_internal_port(&self, port: u16) {
        self.lock().internal_port = port;
    }

    pub fn internal_address(&self) -> Option<Ipv4Addr> {
        self.lock().internal_addr
    }

    pub(crate) fn set_internal_address(&self, addr: Option<Ipv4Addr>) {
        self.lock().internal_addr = addr;
    }

    /// The IGD this mapping was granted on, if it is still around.
    pub fn igd(&self) -> Option<SharedIgd> {
        self.lock().igd.upgrade()
    }

    pub(crate) fn set_igd(&self, igd: &SharedIgd) {
        self.lock().igd = Arc::downgrade(igd);
    }

    /// Protocol of the IGD serving this mapping.
    pub fn protocol(&self) -> Option<NatProtocol> {
        self.igd().map(|igd| igd.protocol())
    }

    /// External address of the mapping, the public side of its IGD.
    pub fn external_address(&self) -> Option<Ipv4Addr> {
        self.igd().and_then(|igd| igd.public_ip())
    }

    pub fn available(&self) -> bool {
        self.lock().available
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub fn auto_update(&self) -> bool {
        self.lock().auto_update
    }

    pub(crate) fn set_auto_update(&self, enable: bool) {
        self.lock().auto_update = enable;
    }

    pub fn state(&self) -> MappingState {
        self.lock().state
    }

    pub(crate) fn set_state(&self, state: MappingState) {
        self.lock().state = state;
    }

    pub(crate) fn notify_callback(&self) -> Option<NotifyCallback> {
        self.lock().notify.clone()
    }

    pub(crate) fn set_notify_callback(&self, cb: Option<NotifyCallback>) {
        self.lock().notify = cb;
    }

    /// Deadline of the next NAT-PMP lease renewal.
    pub fn renewal_time(&self) -> Instant {
        self.lock().renewal_time
    }

    pub(crate) fn set_renewal_time(&self, time: Instant) {
        self.lock().renewal_time = time;
    }

    /// Key of this mapping in the coordinator table.
    pub fn map_key(&self) -> MapKey {
        key_for(self.family, self.internal_port())
    }

    /// A mapping is valid when it has both ports, a live valid IGD and a
    /// non-loopback internal address.
    pub fn is_valid(&self) -> bool {
        let igd = {
            let fields = self.lock();
            if fields.state == MappingState::Failed
                || fields.internal_port == 0
                || fields.external_port == 0
            {
                return false;
            }
            fields.igd.upgrade()
        };
        match igd {
            Some(igd) if igd.is_valid() => self.has_valid_host_address(),
            _ => false,
        }
    }

    /// Whether the internal address is set and usable.
    pub fn has_valid_host_address(&self) -> bool {
        matches!(self.lock().internal_addr, Some(addr) if !addr.is_loopback())
    }

    /// Whether the IGD-side address of this mapping is a public one.
    pub fn has_public_address(&self) -> bool {
        matches!(self.external_address(), Some(addr) if !addr.is_private() && !addr.is_loopback())
    }

    /// Copy the authoritative data carried by a driver response.
    ///
    /// The state transition itself stays with the coordinator.
    pub(crate) fn update_from(&self, result: &MappingInfo, igd: &SharedIgd) {
        let mut fields = self.lock();
        fields.external_port = result.external_port;
        fields.internal_addr = result.internal_addr;
        fields.igd = Arc::downgrade(igd);
        if let Some(renewal) = result.renewal_time {
            fields.renewal_time = renewal;
        }
    }

    /// The description registered with the router for this mapping.
    pub fn description(&self) -> String {
        describe(self.family, self.internal_port())
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.lock();
        f.debug_struct("Mapping")
            .field("family", &self.family)
            .field("external_port", &fields.external_port)
            .field("internal_port", &fields.internal_port)
            .field("internal_addr", &fields.internal_addr)
            .field("state", &fields.state)
            .field("available", &fields.available)
            .field("auto_update", &fields.auto_update)
            .finish()
    }
}

/// Compute the table key for a port and family.
pub fn key_for(family: PortFamily, internal_port: u16) -> MapKey {
    let mut key = MapKey::from(internal_port);
    if family == PortFamily::Udp {
        key |= KEY_FAMILY_BIT;
    }
    key
}

/// Render the router-side description for a mapping, `"JAMI-<TCP|UDP>:<port>"`.
pub(crate) fn describe(family: PortFamily, internal_port: u16) -> String {
    format!("{MAPPING_DESCRIPTION_PREFIX}-{family}:{internal_port}")
}

/// Parse a mapping description back into its family and internal port.
///
/// Inverse of the `"JAMI-<TCP|UDP>:<port>"` format this crate registers
/// with the router.
pub fn parse_description(descr: &str) -> Option<(PortFamily, u16)> {
    let rest = descr
        .strip_prefix(MAPPING_DESCRIPTION_PREFIX)?
        .strip_prefix('-')?;
    let (family, port) = rest.split_once(':')?;
    let family = match family {
        "TCP" => PortFamily::Tcp,
        "UDP" => PortFamily::Udp,
        _ => return None,
    };
    Some((family, port.parse().ok()?))
}

/// Snapshot of a mapping exchanged with the protocol drivers.
///
/// Requests carry the data the driver needs to build a wire request,
/// responses carry the authoritative data granted by the IGD. Results are
/// matched back to table entries by [`MappingInfo::key`].
#[derive(Debug, Clone)]
pub(crate) struct MappingInfo {
    pub family: PortFamily,
    pub internal_port: u16,
    pub external_port: u16,
    pub internal_addr: Option<Ipv4Addr>,
    pub renewal_time: Option<Instant>,
    pub igd: Option<SharedIgd>,
}

impl MappingInfo {
    pub(crate) fn of(mapping: &Mapping) -> Self {
        Self {
            family: mapping.family(),
            internal_port: mapping.internal_port(),
            external_port: mapping.external_port(),
            internal_addr: mapping.internal_address(),
            renewal_time: None,
            igd: mapping.igd(),
        }
    }

    pub(crate) fn key(&self) -> MapKey {
        key_for(self.family, self.internal_port)
    }

    pub(crate) fn description(&self) -> String {
        describe(self.family, self.internal_port)
    }
}

impl fmt::Display for MappingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (external {})", self.description(), self.external_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::igd::MAX_IGD_ERRORS;

    #[test]
    fn key_round_trips() {
        for (family, port) in [
            (PortFamily::Tcp, 1u16),
            (PortFamily::Tcp, 10042),
            (PortFamily::Udp, 20042),
            (PortFamily::Udp, u16::MAX),
        ] {
            let map = Mapping::new(family, port, port, true);
            let key = map.map_key();
            assert_eq!(PortFamily::from_key(key), family);
            assert_eq!((key & 0xffff) as u16, port);
        }
    }

    #[test]
    fn keys_separate_families() {
        let tcp = Mapping::new(PortFamily::Tcp, 12000, 12000, true);
        let udp = Mapping::new(PortFamily::Udp, 12000, 12000, true);
        assert_ne!(tcp.map_key(), udp.map_key());
    }

    #[test]
    fn description_round_trips() {
        let map = Mapping::new(PortFamily::Udp, 20000, 20000, true);
        assert_eq!(map.description(), "JAMI-UDP:20000");
        assert_eq!(
            parse_description(&map.description()),
            Some((PortFamily::Udp, 20000))
        );
        assert_eq!(
            parse_description("JAMI-TCP:10500"),
            Some((PortFamily::Tcp, 10500))
        );
        assert_eq!(parse_description("OTHER-TCP:10500"), None);
        assert_eq!(parse_description("JAMI-TCP"), None);
        assert_eq!(parse_description("JAMI-SCTP:10"), None);
    }

    #[test]
    fn validity_requires_igd_ports_and_address() {
        let igd = Igd::shared(NatProtocol::NatPmp);
        igd.set_public_ip(Some(Ipv4Addr::new(203, 0, 113, 7)));
        igd.set_valid(true);

        let map = Mapping::new(PortFamily::Udp, 20001, 20001, true);
        assert!(!map.is_valid());

        map.set_igd(&igd);
        assert!(!map.is_valid());

        map.set_internal_address(Some(Ipv4Addr::new(192, 168, 1, 2)));
        assert!(map.is_valid());
        assert!(map.has_public_address());

        map.set_internal_address(Some(Ipv4Addr::LOCALHOST));
        assert!(!map.is_valid());

        map.set_internal_address(Some(Ipv4Addr::new(192, 168, 1, 2)));
        map.set_state(MappingState::Failed);
        assert!(!map.is_valid());
    }

    #[test]
    fn validity_follows_igd_errors() {
        let igd = Igd::shared(NatProtocol::NatPmp);
        igd.set_valid(true);

        let map = Mapping::new(PortFamily::Tcp, 10001, 10001, true);
        map.set_igd(&igd);
        map.set_internal_address(Some(Ipv4Addr::new(192, 168, 1, 2)));
        assert!(map.is_valid());

        for _ in 0..MAX_IGD_ERRORS {
            igd.increment_errors();
        }
        assert!(!map.is_valid());
    }

    #[test]
    fn igd_reference_is_not_owning() {
        let map = Mapping::new(PortFamily::Tcp, 10002, 10002, true);
        {
            let igd = Igd::shared(NatProtocol::Pupnp);
            igd.set_valid(true);
            map.set_igd(&igd);
            assert!(map.igd().is_some());
        }
        assert!(map.igd().is_none());
    }

    #[test]
    fn update_from_copies_granted_data() {
        let igd = Igd::shared(NatProtocol::NatPmp);
        igd.set_valid(true);

        let map = Mapping::new(PortFamily::Udp, 20123, 20123, false);
        let renewal = Instant::now() + std::time::Duration::from_secs(2880);
        let result = MappingInfo {
            family: PortFamily::Udp,
            internal_port: 20123,
            external_port: 20999,
            internal_addr: Some(Ipv4Addr::new(192, 168, 1, 2)),
            renewal_time: Some(renewal),
            igd: Some(igd.clone()),
        };
        map.update_from(&result, &igd);

        assert_eq!(map.external_port(), 20999);
        assert_eq!(map.internal_port(), 20123);
        assert_eq!(map.internal_address(), Some(Ipv4Addr::new(192, 168, 1, 2)));
        assert_eq!(map.renewal_time(), renewal);
        // the transition itself belongs to the coordinator
        assert_eq!(map.state(), MappingState::Pending);
    }
}
