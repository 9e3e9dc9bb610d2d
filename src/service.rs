//! The mapping coordinator.
//!
//! Single source of truth for the mapping table and the valid-IGD set. The
//! coordinator runs as one task; protocol drivers never call into it
//! directly, they post [`ObserverEvent`]s onto its channel. The only state
//! read from other threads, the mapping tables and the valid-IGD set, sits
//! behind one mutex taken for short critical sections.

use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rand::Rng;
use smallvec::SmallVec;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, trace, warn};

use crate::{
    defaults,
    igd::{IgdEvent, NatProtocol, SharedIgd},
    mapping::{key_for, MapKey, Mapping, MappingInfo, MappingState, PortFamily, SharedMapping},
    metrics::Metrics,
    Config, ConsumerId, MappingRequest,
};

/// Capacity of the channels to the coordinator and driver tasks.
pub(crate) const SERVICE_CHANNEL_CAPACITY: usize = 64;
pub(crate) const DRIVER_CHANNEL_CAPACITY: usize = 64;

/// Messages understood by the coordinator.
#[derive(derive_more::Debug)]
pub(crate) enum Message {
    RegisterConsumer {
        id: ConsumerId,
    },
    UnregisterConsumer {
        id: ConsumerId,
    },
    /// Give a reserved mapping back, by table key.
    Release {
        key: MapKey,
    },
    /// A reservation registered new table entries; reconcile now.
    MappingsChanged,
    /// The host may have moved networks.
    ConnectivityChanged,
    Shutdown {
        #[debug("_")]
        done: oneshot::Sender<()>,
    },
}

/// Commands understood by both protocol drivers.
///
/// This is the whole protocol-polymorphic surface; the coordinator is the
/// only code aware that there are two implementations behind it.
#[derive(Debug)]
pub(crate) enum DriverCmd {
    SearchForIgd,
    ClearIgds,
    RequestMappingAdd(MappingInfo),
    RequestMappingRenew(MappingInfo),
    RequestMappingRemove(MappingInfo),
    /// Ask for the mappings this host owns on the IGD. Answered with an
    /// [`ObserverEvent::RemoteMappingList`].
    ListRemoteMappings { igd: SharedIgd },
    Terminate { done: oneshot::Sender<()> },
}

/// Events the drivers post back onto the coordinator queue.
#[derive(Debug)]
pub(crate) enum ObserverEvent {
    IgdUpdated {
        igd: SharedIgd,
        event: IgdEvent,
    },
    MappingAdded {
        igd: SharedIgd,
        result: MappingInfo,
    },
    MappingRenewed {
        igd: SharedIgd,
        result: MappingInfo,
    },
    MappingRequestFailed {
        result: MappingInfo,
    },
    MappingRemoved {
        igd: SharedIgd,
        result: MappingInfo,
    },
    RemoteMappingList {
        igd: SharedIgd,
        mappings: BTreeMap<MapKey, MappingInfo>,
    },
}

/// Handle to a spawned protocol driver.
#[derive(Debug)]
pub(crate) struct DriverHandle {
    protocol: NatProtocol,
    cmds: mpsc::Sender<DriverCmd>,
    _task: Option<AbortOnDropHandle<()>>,
}

impl DriverHandle {
    pub(crate) fn new(
        protocol: NatProtocol,
        cmds: mpsc::Sender<DriverCmd>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            protocol,
            cmds,
            _task: Some(AbortOnDropHandle::new(task)),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(protocol: NatProtocol, cmds: mpsc::Sender<DriverCmd>) -> Self {
        Self {
            protocol,
            cmds,
            _task: None,
        }
    }

    pub(crate) fn protocol(&self) -> NatProtocol {
        self.protocol
    }

    /// Post a command to the driver queue.
    ///
    /// Returns `false` when the driver is gone or its queue is full; callers
    /// treat that as a transient failure and rely on the next reconciliation.
    pub(crate) fn send(&self, cmd: DriverCmd) -> bool {
        match self.cmds.try_send(cmd) {
            Ok(()) => true,
            Err(e) => {
                warn!("could not reach the {} driver: {e}", self.protocol);
                false
            }
        }
    }
}

/// State shared between the coordinator task and the client handles.
#[derive(Debug, Default)]
pub(crate) struct State {
    inner: Mutex<StateInner>,
}

#[derive(Debug, Default)]
pub(crate) struct StateInner {
    mappings: [BTreeMap<MapKey, SharedMapping>; 2],
    valid_igds: Vec<SharedIgd>,
    known_public_address: Option<Ipv4Addr>,
    closed: bool,
}

impl StateInner {
    fn list(&self, family: PortFamily) -> &BTreeMap<MapKey, SharedMapping> {
        &self.mappings[family.index()]
    }

    fn list_mut(&mut self, family: PortFamily) -> &mut BTreeMap<MapKey, SharedMapping> {
        &mut self.mappings[family.index()]
    }

    fn all_mappings(&self) -> impl Iterator<Item = &SharedMapping> {
        self.mappings.iter().flat_map(|list| list.values())
    }
}

impl State {
    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether at least one valid IGD is known.
    pub(crate) fn is_ready(&self) -> bool {
        !self.lock().valid_igds.is_empty()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Public address of any valid IGD.
    pub(crate) fn external_ip(&self) -> Option<Ipv4Addr> {
        self.lock().valid_igds.first().and_then(|igd| igd.public_ip())
    }

    pub(crate) fn known_public_address(&self) -> Option<Ipv4Addr> {
        self.lock().known_public_address
    }

    pub(crate) fn set_known_public_address(&self, addr: Ipv4Addr) {
        let mut inner = self.lock();
        if inner.known_public_address != Some(addr) {
            debug!("setting the known public address to {addr}");
            inner.known_public_address = Some(addr);
        }
    }

    pub(crate) fn mapping_with_key(&self, key: MapKey) -> Option<SharedMapping> {
        let inner = self.lock();
        inner.list(PortFamily::from_key(key)).get(&key).cloned()
    }
}

/// Find a reservable mapping, or register a new one.
///
/// Runs on the caller thread; only the shared state lock is taken. An `Open`
/// mapping matching the request is preferred, any other valid available one
/// is handed out otherwise. The coordinator is woken separately to dispatch
/// whatever this created.
pub(crate) fn reserve_mapping(
    state: &State,
    config: &Config,
    request: &MappingRequest,
) -> Option<SharedMapping> {
    if state.is_closed() {
        warn!("the mapping coordinator is shut down");
        return None;
    }

    let desired = request.external_port;
    if desired == 0 {
        debug!(
            "desired port not set, will provide the first available [{}] mapping",
            request.family
        );
    }

    let mut picked: Option<SharedMapping> = None;
    {
        let inner = state.lock();
        for map in inner.list(request.family).values() {
            if !map.available() || !map.is_valid() {
                continue;
            }
            if desired != 0 && map.external_port() != desired {
                continue;
            }
            if picked.is_none() {
                picked = Some(map.clone());
            }
            if map.state() == MappingState::Open {
                picked = Some(map.clone());
                break;
            }
        }
    }

    let picked = match picked {
        Some(map) => Some(map),
        None => {
            debug!("did not find an available mapping, requesting one now");
            register_mapping(
                state,
                config,
                Mapping::new(request.family, desired, desired, true),
            )
        }
    }?;

    picked.set_available(false);
    picked.set_notify_callback(request.notify.clone());
    picked.set_auto_update(request.auto_update);
    if let Some(cb) = picked.notify_callback() {
        cb(picked.clone());
    }
    Some(picked)
}

/// Insert a mapping into the table, allocating ports when unset.
pub(crate) fn register_mapping(
    state: &State,
    config: &Config,
    mapping: Mapping,
) -> Option<SharedMapping> {
    if mapping.external_port() == 0 {
        let port = available_port(state, config, mapping.family());
        if port == 0 {
            return None;
        }
        mapping.set_external_port(port);
        mapping.set_internal_port(port);
    }
    mapping.set_state(MappingState::Pending);

    let map: SharedMapping = Arc::new(mapping);
    let key = map.map_key();
    let mut inner = state.lock();
    match inner.list_mut(map.family()).entry(key) {
        Entry::Occupied(_) => {
            warn!("mapping {map} is already registered");
            None
        }
        Entry::Vacant(slot) => {
            slot.insert(map.clone());
            Some(map)
        }
    }
}

/// Pick a random unused port for the family. No reservation is made here.
///
/// Gives up with 0 after [`defaults::MAX_PORT_RETRIES`] collisions.
pub(crate) fn available_port(state: &State, config: &Config, family: PortFamily) -> u16 {
    let inner = state.lock();
    let range = config.port_range(family);
    let mut rng = rand::thread_rng();
    for _ in 0..defaults::MAX_PORT_RETRIES {
        let port = rng.gen_range(range.clone());
        if !inner.list(family).contains_key(&key_for(family, port)) {
            return port;
        }
    }
    error!(
        "could not find an available [{family}] port after {} attempts",
        defaults::MAX_PORT_RETRIES
    );
    0
}

/// Per-family state counts used by the reconciliation pass.
#[derive(Debug, Default, Clone, Copy)]
struct MappingStatus {
    open: usize,
    ready: usize,
    pending: usize,
    in_progress: usize,
    failed: usize,
}

impl MappingStatus {
    fn merge(&mut self, other: MappingStatus) {
        self.open += other.open;
        self.ready += other.ready;
        self.pending += other.pending;
        self.in_progress += other.in_progress;
        self.failed += other.failed;
    }
}

/// The coordinator actor.
#[derive(Debug)]
pub(crate) struct Service {
    config: Config,
    state: Arc<State>,
    rx: mpsc::Receiver<Message>,
    events_rx: mpsc::Receiver<ObserverEvent>,
    drivers: Vec<DriverHandle>,
    consumers: BTreeSet<ConsumerId>,
    preferred_igd: Option<SharedIgd>,
    started: bool,
    host_address: Option<Ipv4Addr>,
    external_addr_tx: watch::Sender<Option<Ipv4Addr>>,
    metrics: Arc<Metrics>,
}

impl Service {
    pub(crate) fn with_drivers(
        config: Config,
        state: Arc<State>,
        rx: mpsc::Receiver<Message>,
        events_rx: mpsc::Receiver<ObserverEvent>,
        drivers: Vec<DriverHandle>,
        metrics: Arc<Metrics>,
    ) -> (Self, watch::Receiver<Option<Ipv4Addr>>) {
        let (external_addr_tx, watcher) = watch::channel(None);
        let service = Service {
            config,
            state,
            rx,
            events_rx,
            drivers,
            consumers: BTreeSet::new(),
            preferred_igd: None,
            started: false,
            host_address: None,
            external_addr_tx,
            metrics,
        };
        (service, watcher)
    }

    pub(crate) async fn run(mut self) {
        debug!("coordinator starting");
        let mut tick = time::interval(self.config.mapping_update_interval);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut events_open = true;
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => {
                        trace!("tick: msg {msg:?}");
                        if self.handle_message(msg).await {
                            break;
                        }
                    }
                    None => {
                        debug!("all clients are gone, shutting down");
                        self.shutdown().await;
                        break;
                    }
                },
                event = self.events_rx.recv(), if events_open => match event {
                    Some(event) => {
                        trace!("tick: event {event:?}");
                        self.handle_event(event);
                    }
                    None => events_open = false,
                },
                _ = tick.tick() => {
                    if self.started {
                        self.update_mapping_list();
                    }
                }
            }
        }
        debug!("coordinator stopped");
    }

    /// Returns `true` when the service should stop.
    async fn handle_message(&mut self, msg: Message) -> bool {
        match msg {
            Message::RegisterConsumer { id } => self.register_consumer(id),
            Message::UnregisterConsumer { id } => self.unregister_consumer(id),
            Message::Release { key } => self.release_mapping(key),
            Message::MappingsChanged => self.update_mapping_list(),
            Message::ConnectivityChanged => self.connectivity_changed(),
            Message::Shutdown { done } => {
                self.shutdown().await;
                let _ = done.send(());
                return true;
            }
        }
        false
    }

    fn handle_event(&mut self, event: ObserverEvent) {
        match event {
            ObserverEvent::IgdUpdated { igd, event } => self.on_igd_updated(igd, event),
            ObserverEvent::MappingAdded { igd, result } => self.on_mapping_added(igd, result),
            ObserverEvent::MappingRenewed { igd, result } => self.on_mapping_renewed(igd, result),
            ObserverEvent::MappingRequestFailed { result } => self.on_mapping_request_failed(result),
            ObserverEvent::MappingRemoved { igd, result } => self.on_mapping_removed(igd, result),
            ObserverEvent::RemoteMappingList { igd, mappings } => {
                self.handle_remote_mapping_list(igd, mappings)
            }
        }
    }

    fn register_consumer(&mut self, id: ConsumerId) {
        if self.state.is_closed() {
            warn!("the mapping coordinator is already shut down");
            return;
        }
        if !self.consumers.insert(id) {
            warn!("consumer {id} is already registered");
            return;
        }
        debug!("registered consumer {id}");
        if !self.started {
            self.start_upnp();
        }
    }

    fn unregister_consumer(&mut self, id: ConsumerId) {
        if self.consumers.remove(&id) {
            debug!("unregistered consumer {id}");
        } else {
            debug!("consumer {id} was already removed");
        }
        if self.consumers.is_empty() {
            self.stop_upnp(false);
        }
    }

    fn start_upnp(&mut self) {
        debug!("starting the port mapping subsystem");
        self.host_address = crate::ip_and_gateway().ok().map(|(ip, _)| ip);
        for driver in &self.drivers {
            driver.send(DriverCmd::SearchForIgd);
        }
        self.started = true;
    }

    /// Tear down all mappings and stop the drivers.
    ///
    /// Mappings with auto-update enabled survive in the table, unless
    /// `force_release` is set, so they can be re-established after a restart.
    fn stop_upnp(&mut self, force_release: bool) {
        debug!("stopping the port mapping subsystem");
        let to_remove: Vec<SharedMapping> = {
            let mut inner = self.state.lock();
            let maps = inner.all_mappings().cloned().collect();
            inner.valid_igds.clear();
            maps
        };
        self.preferred_igd = None;
        self.external_addr_tx.send_replace(None);

        for map in to_remove {
            self.request_remove_mapping(&map);
            // No notifications on teardown; a state change callback here
            // could trigger consumer work while everything is going away.
            self.update_mapping_state(&map, MappingState::Failed, false);
            if !map.auto_update() || force_release {
                map.set_auto_update(false);
                self.unregister_mapping(&map);
            }
        }

        for driver in &self.drivers {
            driver.send(DriverCmd::ClearIgds);
        }
        self.started = false;
    }

    async fn shutdown(&mut self) {
        debug!("shutting down the coordinator");
        self.stop_upnp(true);
        for driver in &self.drivers {
            let (done_tx, done_rx) = oneshot::channel();
            if driver.send(DriverCmd::Terminate { done: done_tx })
                && time::timeout(defaults::TERMINATE_GRACE, done_rx).await.is_err()
            {
                warn!(
                    "{} driver did not stop within the grace period",
                    driver.protocol()
                );
            }
        }
        let mut inner = self.state.lock();
        for list in &mut inner.mappings {
            list.clear();
        }
        inner.valid_igds.clear();
        inner.closed = true;
    }

    fn connectivity_changed(&mut self) {
        let current = crate::ip_and_gateway().ok().map(|(ip, _)| ip);
        debug!("connectivity change check: host address {current:?}");

        let mut restart = !self.state.is_ready();
        if !restart && current != self.host_address {
            warn!(
                "host address changed from {:?} to {current:?}",
                self.host_address
            );
            restart = true;
        }
        if !restart {
            return;
        }
        // A new search is performed once a consumer registers.
        if self.consumers.is_empty() {
            return;
        }

        debug!("connectivity changed, clearing the IGDs and restarting");
        self.stop_upnp(false);
        self.start_upnp();
        self.process_auto_update_mappings();
    }

    fn release_mapping(&mut self, key: MapKey) {
        let Some(map) = self.state.mapping_with_key(key) else {
            // Might happen if the mapping failed or was never granted.
            debug!("mapping {key:#x} does not exist or was already removed");
            return;
        };
        if map.available() {
            warn!("trying to release an unused mapping {map}");
            return;
        }

        map.set_auto_update(false);
        map.set_notify_callback(None);
        map.set_available(true);
        if map.is_valid() {
            // The entry leaves the table once the driver confirms.
            self.request_remove_mapping(&map);
        } else {
            self.unregister_mapping(&map);
        }
    }

    fn driver_for(&self, protocol: NatProtocol) -> Option<&DriverHandle> {
        self.drivers.iter().find(|d| d.protocol() == protocol)
    }

    fn protocol_ready(&self, protocol: NatProtocol) -> bool {
        self.state
            .lock()
            .valid_igds
            .iter()
            .any(|igd| igd.protocol() == protocol && igd.is_valid())
    }

    /// One reconciliation pass; also runs every
    /// [`Config::mapping_update_interval`].
    fn update_mapping_list(&mut self) {
        self.update_preferred_igd();

        if self.consumers.is_empty() {
            return;
        }
        let Some(preferred) = self.preferred_igd.clone() else {
            debug!("port mapping enabled, but no valid IGDs available");
            return;
        };

        self.process_pending_requests(&preferred);
        self.process_auto_update_mappings();

        for family in [PortFamily::Tcp, PortFamily::Udp] {
            let status = self.mapping_status(family);
            debug!(
                "mapping status [{family}]: {} open ({} ready + {} in use), {} pending, {} in-progress, {} failed",
                status.open,
                status.ready,
                status.open - status.ready,
                status.pending,
                status.in_progress,
                status.failed,
            );

            let missing = self.config.min_open_ports(family) as isize
                - (status.ready + status.in_progress + status.pending) as isize;
            if missing > 0 {
                self.provision_new_mappings(family, missing as usize);
            } else if status.ready > self.config.max_open_ports(family) {
                self.delete_unneeded_mappings(
                    family,
                    status.ready - self.config.max_open_ports(family),
                );
            }
        }

        // Dispatch whatever the passes above created.
        self.process_pending_requests(&preferred);

        let natpmp_ready = self.protocol_ready(NatProtocol::NatPmp);
        if self.protocol_ready(NatProtocol::Pupnp) && !natpmp_ready {
            self.prune_mapping_list(&preferred);
        }
        if natpmp_ready {
            self.renew_allocations();
        }
    }

    fn update_preferred_igd(&mut self) {
        if self
            .preferred_igd
            .as_ref()
            .is_some_and(|igd| igd.is_valid())
        {
            self.update_external_address();
            return;
        }

        let mut best: Option<SharedIgd> = None;
        {
            let inner = self.state.lock();
            for igd in &inner.valid_igds {
                if !igd.is_valid() {
                    continue;
                }
                // Prefer NAT-PMP: renewal-based leases are cheaper and
                // survive router reboots more cleanly than permanent UPnP
                // leases that may silently vanish.
                if igd.protocol() == NatProtocol::NatPmp {
                    best = Some(igd.clone());
                    break;
                }
                if best.is_none() {
                    best = Some(igd.clone());
                }
            }
        }
        self.preferred_igd = best;
        if let Some(igd) = &self.preferred_igd {
            debug!("preferred IGD updated to {igd} [{}]", igd.protocol());
        }
        self.update_external_address();
    }

    fn update_external_address(&self) {
        let external = self.state.external_ip();
        self.external_addr_tx.send_if_modified(|current| {
            if *current != external {
                *current = external;
                true
            } else {
                false
            }
        });
    }

    fn process_pending_requests(&self, preferred: &SharedIgd) {
        let pending: Vec<SharedMapping> = {
            let inner = self.state.lock();
            inner
                .all_mappings()
                .filter(|map| map.state() == MappingState::Pending)
                .cloned()
                .collect()
        };
        for map in pending {
            debug!("sending pending request for mapping {map} to IGD {preferred}");
            self.request_mapping(&map, preferred);
        }
    }

    fn request_mapping(&self, map: &SharedMapping, igd: &SharedIgd) {
        let Some(driver) = self.driver_for(igd.protocol()) else {
            return;
        };
        map.set_igd(igd);
        if map.state() != MappingState::InProgress {
            self.update_mapping_state(map, MappingState::InProgress, true);
        }
        self.metrics.mapping_requests.inc();
        if !driver.send(DriverCmd::RequestMappingAdd(MappingInfo::of(map))) {
            // driver unreachable; retried on the next pass
            map.set_state(MappingState::Pending);
        }
    }

    /// Replace failed mappings that have auto-update enabled with fresh
    /// reservations on new random ports.
    fn process_auto_update_mappings(&mut self) {
        let failed: Vec<SharedMapping> = {
            let inner = self.state.lock();
            inner
                .all_mappings()
                .filter(|map| map.state() == MappingState::Failed && map.auto_update())
                .cloned()
                .collect()
        };
        for old in failed {
            debug!("mapping {old} has auto-update enabled, requesting a replacement");
            let request = MappingRequest {
                family: old.family(),
                external_port: 0,
                auto_update: true,
                notify: old.notify_callback(),
            };
            if reserve_mapping(&self.state, &self.config, &request).is_none() {
                warn!("could not allocate a replacement for mapping {old}");
            }
            old.set_available(true);
            old.set_auto_update(false);
            old.set_notify_callback(None);
            self.unregister_mapping(&old);
        }
    }

    fn mapping_status(&self, family: PortFamily) -> MappingStatus {
        let inner = self.state.lock();
        let mut status = MappingStatus::default();
        for map in inner.list(family).values() {
            match map.state() {
                MappingState::Pending => status.pending += 1,
                MappingState::InProgress => status.in_progress += 1,
                MappingState::Failed => status.failed += 1,
                MappingState::Open => {
                    status.open += 1;
                    if map.available() {
                        status.ready += 1;
                    }
                }
            }
        }
        status
    }

    fn provision_new_mappings(&self, family: PortFamily, count: usize) {
        debug!("provisioning {count} new mappings of type [{family}]");
        for _ in 0..count {
            if register_mapping(&self.state, &self.config, Mapping::new(family, 0, 0, true))
                .is_none()
            {
                error!("could not provision a new [{family}] mapping");
                break;
            }
        }
    }

    fn delete_unneeded_mappings(&self, family: PortFamily, mut count: usize) {
        debug!("removing {count} unneeded mappings of type [{family}]");
        let (to_close, to_drop): (Vec<SharedMapping>, Vec<SharedMapping>) = {
            let inner = self.state.lock();
            let mut to_close = Vec::new();
            let mut to_drop = Vec::new();
            for map in inner.list(family).values() {
                if !map.available() {
                    continue;
                }
                match map.state() {
                    MappingState::Open if count > 0 => {
                        to_close.push(map.clone());
                        count -= 1;
                    }
                    MappingState::Open => {}
                    // With more open mappings than needed, spare requests
                    // still in flight are dropped as well.
                    _ => to_drop.push(map.clone()),
                }
            }
            (to_close, to_drop)
        };
        for map in to_close {
            self.request_remove_mapping(&map);
            self.unregister_mapping(&map);
        }
        for map in to_drop {
            self.unregister_mapping(&map);
        }
    }

    /// Reconcile the local table against the list the router reports.
    ///
    /// Skipped while allocation requests are in flight to avoid competing
    /// with them. The answer arrives as a [`ObserverEvent::RemoteMappingList`].
    fn prune_mapping_list(&self, preferred: &SharedIgd) {
        let mut status = self.mapping_status(PortFamily::Tcp);
        status.merge(self.mapping_status(PortFamily::Udp));
        if status.in_progress != 0 || status.pending != 0 {
            return;
        }
        if preferred.protocol() != NatProtocol::Pupnp {
            return;
        }
        let Some(driver) = self.driver_for(NatProtocol::Pupnp) else {
            return;
        };
        driver.send(DriverCmd::ListRemoteMappings {
            igd: preferred.clone(),
        });
    }

    fn handle_remote_mapping_list(
        &mut self,
        igd: SharedIgd,
        remote: BTreeMap<MapKey, MappingInfo>,
    ) {
        if remote.is_empty() {
            let inner = self.state.lock();
            if !inner.list(PortFamily::Tcp).is_empty() || !inner.list(PortFamily::Udp).is_empty() {
                warn!("we have provisioned mappings but the IGD returned an empty list");
            }
        }
        self.prune_unmatched_mappings(&igd, &remote);
        self.prune_untracked_mappings(&remote);
    }

    /// Demote local `Open` UPnP mappings the router no longer reports.
    fn prune_unmatched_mappings(&self, igd: &SharedIgd, remote: &BTreeMap<MapKey, MappingInfo>) {
        let to_fail: Vec<SharedMapping> = {
            let inner = self.state.lock();
            inner
                .all_mappings()
                .filter(|map| {
                    map.protocol() == Some(NatProtocol::Pupnp)
                        && map.state() == MappingState::Open
                        && !remote.contains_key(&map.map_key())
                })
                .cloned()
                .collect()
        };
        for map in to_fail {
            warn!(
                "mapping {map} is marked open but not found in the IGD {igd} list, marking failed"
            );
            self.update_mapping_state(&map, MappingState::Failed, true);
            self.unregister_mapping(&map);
        }
    }

    /// Delete router entries with no local counterpart, typically leftovers
    /// from a crashed prior instance.
    fn prune_untracked_mappings(&self, remote: &BTreeMap<MapKey, MappingInfo>) {
        // A deletion storm is worse than a few stale entries; bound the batch.
        let mut to_remove: SmallVec<[MappingInfo; defaults::MAX_UNTRACKED_DELETES]> =
            SmallVec::new();
        {
            let inner = self.state.lock();
            for (key, info) in remote {
                if !inner.list(info.family).contains_key(key) {
                    to_remove.push(info.clone());
                    if to_remove.len() >= defaults::MAX_UNTRACKED_DELETES {
                        break;
                    }
                }
            }
        }
        let Some(driver) = self.driver_for(NatProtocol::Pupnp) else {
            return;
        };
        for info in to_remove {
            debug!("deleting untracked mapping {info} found on the IGD");
            self.metrics.untracked_deletes.inc();
            driver.send(DriverCmd::RequestMappingRemove(info));
        }
    }

    /// Renew NAT-PMP allocations whose renewal deadline passed.
    fn renew_allocations(&self) {
        let now = Instant::now();
        let to_renew: SmallVec<[SharedMapping; 8]> = {
            let inner = self.state.lock();
            inner
                .all_mappings()
                .filter(|map| {
                    map.is_valid()
                        && map.protocol() == Some(NatProtocol::NatPmp)
                        && map.state() == MappingState::Open
                        && map.renewal_time() <= now
                })
                .cloned()
                .collect()
        };
        let Some(driver) = self.driver_for(NatProtocol::NatPmp) else {
            return;
        };
        for map in to_renew {
            driver.send(DriverCmd::RequestMappingRenew(MappingInfo::of(&map)));
        }
    }

    fn request_remove_mapping(&self, map: &SharedMapping) {
        if !map.is_valid() {
            // Nothing was granted, nothing to undo.
            return;
        }
        let Some(igd) = map.igd() else {
            return;
        };
        let Some(driver) = self.driver_for(igd.protocol()) else {
            return;
        };
        driver.send(DriverCmd::RequestMappingRemove(MappingInfo::of(map)));
    }

    fn update_mapping_state(&self, map: &SharedMapping, state: MappingState, notify: bool) {
        if map.state() == state {
            trace!("mapping {map} is already in state {state}");
            return;
        }
        map.set_state(state);
        if notify {
            if let Some(cb) = map.notify_callback() {
                cb(map.clone());
            }
        }
    }

    fn unregister_mapping(&self, map: &SharedMapping) {
        if map.auto_update() {
            // Keep it around, a replacement will be requested on its behalf.
            return;
        }
        let mut inner = self.state.lock();
        if inner.list_mut(map.family()).remove(&map.map_key()).is_some() {
            debug!("unregistered mapping {map}");
        }
    }

    // Observer event handlers.

    fn on_igd_updated(&mut self, igd: SharedIgd, event: IgdEvent) {
        // Restart the search for the best IGD.
        self.preferred_igd = None;

        debug!("new event for IGD {igd} [{}]: {event}", igd.protocol());

        match event {
            IgdEvent::Added => {
                if igd.local_ip().is_none() {
                    warn!("[{}] IGD has an invalid local address", igd.protocol());
                    return;
                }
                let Some(public_ip) = igd.public_ip() else {
                    warn!("[{}] IGD has an invalid public address", igd.protocol());
                    return;
                };
                if let Some(known) = self.state.known_public_address() {
                    if known != public_ip {
                        warn!(
                            "IGD external address {public_ip} does not match the known public \
                             address {known}; the mapped addresses might not be reachable"
                        );
                    }
                }
                {
                    let mut inner = self.state.lock();
                    let present = inner
                        .valid_igds
                        .iter()
                        .any(|existing| Arc::ptr_eq(existing, &igd) || **existing == *igd);
                    if present {
                        debug!("IGD {igd} is already in the valid list");
                        return;
                    }
                    inner.valid_igds.push(igd.clone());
                }
                self.update_mapping_list();
            }
            IgdEvent::Removed | IgdEvent::InvalidState => {
                warn!(
                    "state of IGD {igd} [{}] changed to {event}, pruning the mapping list",
                    igd.protocol()
                );
                self.prune_mappings_with_invalid_igd(&igd);
                {
                    let mut inner = self.state.lock();
                    inner
                        .valid_igds
                        .retain(|existing| !Arc::ptr_eq(existing, &igd) && **existing != *igd);
                }
                self.update_mapping_list();
            }
        }
    }

    fn prune_mappings_with_invalid_igd(&self, igd: &SharedIgd) {
        let to_remove: Vec<SharedMapping> = {
            let inner = self.state.lock();
            inner
                .all_mappings()
                .filter(|map| map.igd().is_some_and(|owner| Arc::ptr_eq(&owner, igd)))
                .cloned()
                .collect()
        };
        for map in to_remove {
            debug!("removing mapping {map}, its IGD is gone");
            self.update_mapping_state(&map, MappingState::Failed, true);
            self.unregister_mapping(&map);
        }
    }

    fn on_mapping_added(&mut self, igd: SharedIgd, result: MappingInfo) {
        let Some(map) = self.state.mapping_with_key(result.key()) else {
            // We may receive a response for a canceled request; ignore it.
            debug!("response for mapping {result} does not have a local match");
            return;
        };

        map.update_from(&result, &igd);
        self.update_mapping_state(&map, MappingState::Open, true);
        // Each successful response resets the IGD error counter.
        igd.set_valid(true);
        self.update_external_address();
        debug!("mapping {map} successfully performed on IGD {igd}");
    }

    fn on_mapping_renewed(&mut self, igd: SharedIgd, result: MappingInfo) {
        let Some(map) = self.state.mapping_with_key(result.key()) else {
            warn!("renewed mapping {result} does not have a local match");
            return;
        };
        if map.protocol() != Some(NatProtocol::NatPmp)
            || !map.is_valid()
            || map.state() != MappingState::Open
        {
            warn!("renewed mapping {map} from IGD {igd} is in an unexpected state");
            return;
        }
        if let Some(renewal) = result.renewal_time {
            map.set_renewal_time(renewal);
        }
    }

    fn on_mapping_request_failed(&mut self, result: MappingInfo) {
        let Some(map) = self.state.mapping_with_key(result.key()) else {
            // We may receive a response for a removed request; ignore it.
            debug!("failed mapping {result} does not have a local match");
            return;
        };
        self.metrics.mapping_failures.inc();
        warn!("mapping request for {map} failed");
        self.update_mapping_state(&map, MappingState::Failed, true);
        self.unregister_mapping(&map);
    }

    fn on_mapping_removed(&mut self, igd: SharedIgd, result: MappingInfo) {
        trace!("mapping {result} removed on IGD {igd}");
        let Some(map) = self.state.mapping_with_key(result.key()) else {
            return;
        };
        // Best effort; the consumer may see removals it did not initiate.
        if let Some(cb) = map.notify_callback() {
            cb(map.clone());
        }
        if map.available() {
            // A released mapping leaves the table once confirmed.
            self.unregister_mapping(&map);
        }
    }
}
