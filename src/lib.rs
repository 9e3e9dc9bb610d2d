//! Port mapping coordinator for NAT traversal.
//!
//! Discovers Internet Gateway Devices on the local network over two
//! protocols, UPnP IGD:1 and NAT-PMP, keeps an authoritative table of
//! port mappings for the registered consumers, and reconciles that table
//! periodically against what the gateway actually has provisioned.
//!
//! The entry point is [`Client`]: register a consumer, [`reserve`]
//! mappings, watch their state through the notify callback, [`release`]
//! them when done. Everything else, discovery, renewal, pruning of stale
//! router entries, runs in the background.
//!
//! [`reserve`]: Client::reserve
//! [`release`]: Client::release

use std::{
    net::Ipv4Addr,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use netwatch::interfaces::HomeRouter;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time,
};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info_span, trace, warn, Instrument};

mod igd;
mod mapping;
mod metrics;
mod nat_pmp;
mod service;
mod upnp;
mod util;

pub use igd::{Igd, IgdEvent, NatProtocol, SharedIgd, MAX_IGD_ERRORS};
pub use mapping::{
    key_for, parse_description, MapKey, Mapping, MappingState, NotifyCallback, PortFamily,
    SharedMapping, MAPPING_DESCRIPTION_PREFIX,
};
pub use metrics::Metrics;

use service::{Message, Service, State, SERVICE_CHANNEL_CAPACITY};

pub(crate) mod defaults {
    use std::time::Duration;

    /// Interval between two reconciliation passes over the mapping table.
    pub(crate) const MAPPING_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

    /// Range ports for TCP mappings are drawn from.
    pub(crate) const TCP_PORT_RANGE: (u16, u16) = (10000, 15000);

    /// Range ports for UDP mappings are drawn from.
    pub(crate) const UDP_PORT_RANGE: (u16, u16) = (20000, 25000);

    /// Minimum reservable mappings kept per family (TCP, UDP).
    pub(crate) const MIN_OPEN_PORTS: [usize; 2] = [4, 8];

    /// Ceiling of ready mappings per family (TCP, UDP).
    pub(crate) const MAX_OPEN_PORTS: [usize; 2] = [8, 12];

    /// Random draws tried before port allocation gives up.
    pub(crate) const MAX_PORT_RETRIES: usize = 20;

    /// Untracked router entries deleted per reconciliation pass.
    pub(crate) const MAX_UNTRACKED_DELETES: usize = 5;

    /// Maximum duration of one SSDP search round.
    pub(crate) const UPNP_SEARCH_TIMEOUT: Duration = Duration::from_secs(60);

    /// Timeout to receive a response from a NAT-PMP server.
    pub(crate) const NAT_PMP_RECV_TIMEOUT: Duration = Duration::from_millis(500);

    /// UDP port of the NAT-PMP server on the gateway.
    pub(crate) const NAT_PMP_SERVER_PORT: u16 = 5351;

    /// How long each driver gets to drain at shutdown.
    pub(crate) const TERMINATE_GRACE: Duration = Duration::from_secs(10);

    /// How long a client waits for the whole subsystem to shut down.
    pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
}

/// Tunable knobs of the port mapping subsystem.
///
/// The defaults are the production values; tighten them in tests or when
/// embedding into applications with different port budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Whether the UPnP IGD:1 driver is started.
    pub enable_upnp: bool,
    /// Whether the NAT-PMP driver is started.
    pub enable_nat_pmp: bool,
    /// Ports for TCP mappings are drawn from this half-open range.
    pub tcp_port_range: (u16, u16),
    /// Ports for UDP mappings are drawn from this half-open range.
    pub udp_port_range: (u16, u16),
    /// Minimum reservable mappings kept provisioned per family (TCP, UDP).
    pub min_open_ports: [usize; 2],
    /// Ceiling of ready mappings per family (TCP, UDP).
    pub max_open_ports: [usize; 2],
    /// Interval between two reconciliation passes.
    pub mapping_update_interval: Duration,
    /// NAT-PMP gateway override; the default gateway is probed when unset.
    pub natpmp_gateway: Option<Ipv4Addr>,
    /// UDP port of the NAT-PMP server on the gateway.
    pub natpmp_server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enable_upnp: true,
            enable_nat_pmp: true,
            tcp_port_range: defaults::TCP_PORT_RANGE,
            udp_port_range: defaults::UDP_PORT_RANGE,
            min_open_ports: defaults::MIN_OPEN_PORTS,
            max_open_ports: defaults::MAX_OPEN_PORTS,
            mapping_update_interval: defaults::MAPPING_UPDATE_INTERVAL,
            natpmp_gateway: None,
            natpmp_server_port: defaults::NAT_PMP_SERVER_PORT,
        }
    }
}

impl Config {
    pub(crate) fn port_range(&self, family: PortFamily) -> Range<u16> {
        let (min, max) = match family {
            PortFamily::Tcp => self.tcp_port_range,
            PortFamily::Udp => self.udp_port_range,
        };
        min..max
    }

    pub(crate) fn min_open_ports(&self, family: PortFamily) -> usize {
        self.min_open_ports[family.index()]
    }

    pub(crate) fn max_open_ports(&self, family: PortFamily) -> usize {
        self.max_open_ports[family.index()]
    }
}

/// Opaque handle identifying one consumer of the subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub struct ConsumerId(pub(crate) u64);

/// Parameters of a [`Client::reserve`] call.
#[derive(derive_more::Debug, Clone)]
pub struct MappingRequest {
    /// Transport family to map.
    pub family: PortFamily,
    /// Requested external port. Zero lets the coordinator pick one.
    pub external_port: u16,
    /// Re-allocate on a fresh random port whenever the mapping fails.
    pub auto_update: bool,
    /// Invoked on every state change of the reserved mapping.
    #[debug(skip)]
    pub notify: Option<NotifyCallback>,
}

impl MappingRequest {
    pub fn new(family: PortFamily) -> Self {
        Self {
            family,
            external_port: 0,
            auto_update: false,
            notify: None,
        }
    }
}

/// Error for [`ip_and_gateway`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum GatewayError {
    #[error("no gateway found")]
    NoGateway,
    #[error("gateway found is ipv6, ignoring")]
    Ipv6Gateway,
}

/// Gets the local ip and gateway address for port mapping.
pub(crate) fn ip_and_gateway() -> Result<(Ipv4Addr, Ipv4Addr), GatewayError> {
    let Some(HomeRouter { gateway, my_ip }) = HomeRouter::new() else {
        return Err(GatewayError::NoGateway);
    };

    let local_ip = match my_ip {
        Some(std::net::IpAddr::V4(ip))
            if !ip.is_unspecified() && !ip.is_loopback() && !ip.is_multicast() =>
        {
            ip
        }
        other => {
            debug!("no address suitable for port mapping found ({other:?}), using localhost");
            Ipv4Addr::LOCALHOST
        }
    };

    let std::net::IpAddr::V4(gateway) = gateway else {
        return Err(GatewayError::Ipv6Gateway);
    };

    Ok((local_ip, gateway))
}

/// Port mapping client.
///
/// Cheap to clone. The coordinator and the protocol drivers stop when the
/// last clone is dropped, or earlier through [`Client::shutdown`].
#[derive(Debug, Clone)]
pub struct Client {
    config: Arc<Config>,
    state: Arc<State>,
    /// Channel used to communicate with the coordinator.
    service_tx: mpsc::Sender<Message>,
    /// A watcher over the most recent external address.
    external_addr: watch::Receiver<Option<Ipv4Addr>>,
    next_consumer: Arc<AtomicU64>,
    /// Cancels the coordinator task once the last client is dropped.
    _service_handle: Arc<AbortOnDropHandle<()>>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Client {
    /// Create a new port mapping client and start the coordinator.
    pub fn new(config: Config) -> Self {
        let metrics = Arc::new(Metrics::default());
        let state = Arc::new(State::default());
        let (service_tx, service_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(SERVICE_CHANNEL_CAPACITY);

        let mut drivers = Vec::with_capacity(2);
        if config.enable_nat_pmp {
            drivers.push(nat_pmp::spawn(&config, events_tx.clone(), metrics.clone()));
        }
        if config.enable_upnp {
            drivers.push(upnp::spawn(events_tx.clone(), metrics.clone()));
        }

        let (service, external_addr) = Service::with_drivers(
            config.clone(),
            state.clone(),
            service_rx,
            events_rx,
            drivers,
            metrics,
        );
        let handle = AbortOnDropHandle::new(tokio::spawn(
            service.run().instrument(info_span!("portkeeper.service")),
        ));

        Client {
            config: Arc::new(config),
            state,
            service_tx,
            external_addr,
            next_consumer: Arc::new(AtomicU64::new(1)),
            _service_handle: Arc::new(handle),
        }
    }

    /// Register a consumer. The first registration starts IGD discovery.
    pub fn register_consumer(&self) -> ConsumerId {
        let id = ConsumerId(self.next_consumer.fetch_add(1, Ordering::Relaxed));
        self.send(Message::RegisterConsumer { id });
        id
    }

    /// Unregister a consumer. When none are left, all mappings are torn
    /// down and the protocol drivers stop.
    pub fn unregister_consumer(&self, id: ConsumerId) {
        self.send(Message::UnregisterConsumer { id });
    }

    /// Whether at least one valid IGD is available.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Public address of any valid IGD.
    pub fn external_ip(&self) -> Option<Ipv4Addr> {
        self.state.external_ip()
    }

    /// Record the publicly visible address of this host, as learnt out of
    /// band. IGDs reporting a different external address are flagged in the
    /// logs but not rejected.
    pub fn set_public_address(&self, addr: Ipv4Addr) {
        self.state.set_known_public_address(addr);
    }

    /// Reserve a mapping.
    ///
    /// Hands out an existing open mapping matching the request when one is
    /// available, otherwise registers a new reservation and asks the
    /// coordinator to establish it. Progress is reported through
    /// [`MappingRequest::notify`]. Returns `None` when no port could be
    /// allocated or the subsystem is shut down.
    pub fn reserve(&self, request: &MappingRequest) -> Option<SharedMapping> {
        let map = service::reserve_mapping(&self.state, &self.config, request)?;
        self.send(Message::MappingsChanged);
        Some(map)
    }

    /// Give a reserved mapping back.
    ///
    /// The mapping becomes reservable again and its router-side entry is
    /// removed asynchronously. Releasing an unknown or already-released
    /// mapping is a logged no-op.
    pub fn release(&self, mapping: &SharedMapping) {
        self.send(Message::Release {
            key: mapping.map_key(),
        });
    }

    /// Tell the subsystem the host network may have changed.
    ///
    /// Discovery restarts when the valid-IGD set is empty or the local
    /// address moved; otherwise this is a no-op.
    pub fn connectivity_changed(&self) {
        self.send(Message::ConnectivityChanged);
    }

    /// Watch the external address for changes in the valid-IGD set.
    pub fn watch_external_address(&self) -> watch::Receiver<Option<Ipv4Addr>> {
        self.external_addr.clone()
    }

    /// Stop the subsystem: release every mapping and terminate the drivers,
    /// waiting up to 30 s for the teardown to complete.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .service_tx
            .send(Message::Shutdown { done: done_tx })
            .await
            .is_err()
        {
            return; // already gone
        }
        if time::timeout(defaults::SHUTDOWN_GRACE, done_rx).await.is_err() {
            warn!("shutdown timed out");
        }
    }

    fn send(&self, msg: Message) {
        // the requester can't do much with a failure here, so log it
        if let Err(e) = self.service_tx.try_send(msg) {
            trace!("could not reach the coordinator: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_carries_the_production_constants() {
        let config = Config::default();
        assert_eq!(config.tcp_port_range, (10000, 15000));
        assert_eq!(config.udp_port_range, (20000, 25000));
        assert_eq!(config.min_open_ports, [4, 8]);
        assert_eq!(config.max_open_ports, [8, 12]);
        assert_eq!(config.mapping_update_interval, Duration::from_secs(30));
        assert_eq!(config.natpmp_server_port, 5351);
        assert!(config.enable_upnp);
        assert!(config.enable_nat_pmp);
    }

    #[test]
    fn port_ranges_select_by_family() {
        let config = Config::default();
        assert_eq!(config.port_range(PortFamily::Tcp), 10000..15000);
        assert_eq!(config.port_range(PortFamily::Udp), 20000..25000);
        assert_eq!(config.min_open_ports(PortFamily::Tcp), 4);
        assert_eq!(config.max_open_ports(PortFamily::Udp), 12);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = Config::default();
        let json = serde_json::to_string(&config).expect("serializable");
        let back: Config = serde_json::from_str(&json).expect("deserializable");
        assert_eq!(back.tcp_port_range, config.tcp_port_range);
        assert_eq!(back.mapping_update_interval, config.mapping_update_interval);
    }
}
