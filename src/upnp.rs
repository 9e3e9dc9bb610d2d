//! UPnP IGD:1 protocol driver.
//!
//! SSDP discovery, device description parsing and SOAP action encoding are
//! delegated to `igd-next`; this driver owns the gateway handles, validates
//! candidates, executes port mapping actions and reports results back to the
//! coordinator as observer events. Everything runs on one dedicated task.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use igd_next::{
    aio as aigd, AddPortError, GetExternalIpError, GetGenericPortMappingEntryError,
    PortMappingProtocol, RemovePortError, RequestError, SearchError,
};
use nested_enum_utils::common_fields;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tokio::{
    sync::mpsc,
    task::JoinError,
    time::{self, Sleep},
};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info_span, trace, warn, Instrument};
use url::Url;

use crate::{
    defaults::UPNP_SEARCH_TIMEOUT as SEARCH_TIMEOUT,
    igd::{Igd, IgdEvent, NatProtocol, SharedIgd},
    mapping::{MapKey, MappingInfo, PortFamily, MAPPING_DESCRIPTION_PREFIX},
    metrics::Metrics,
    service::{DriverCmd, DriverHandle, ObserverEvent, DRIVER_CHANNEL_CAPACITY},
    util::MaybeFuture,
};

pub(crate) type Gateway = aigd::Gateway<aigd::tokio::Tokio>;

/// Lease duration requested from the router. Zero means a permanent lease;
/// the prune pass cleans up whatever outlives us.
const PORT_MAPPING_LEASE_DURATION: u32 = 0;

/// IGD search attempts before UPnP gives up until the next search request.
const MAX_SEARCH_RETRIES: u32 = 3;

/// Base unit of the backoff between two IGD searches.
const SEARCH_RETRY_UNIT: Duration = Duration::from_secs(10);

/// SOAP fault returned when a port mapping entry index is out of range.
const SOAP_ARRAY_IDX_INVALID: u16 = 713;

/// SOAP fault for conflicting mappings. Some routers return it instead of
/// 713 when iterating past the end of the mapping list.
const SOAP_CONFLICT_IN_MAPPING: u16 = 718;

type RetryTimer = MaybeFuture<Pin<Box<Sleep>>>;
type SearchTask = AbortOnDropHandle<Result<(Gateway, Ipv4Addr), Error>>;

#[common_fields({
    backtrace: Option<Backtrace>
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("igd search timed out"))]
    SearchTimeout {},
    #[snafu(display("igd search failed"))]
    Search { source: SearchError },
    #[snafu(display("could not get the gateway external ip"))]
    GetExternalIp { source: GetExternalIpError },
    #[snafu(display("gateway external ip is not a usable ipv4 address"))]
    NotIpv4 {},
    #[snafu(display("mapping request for an unknown or invalid igd"))]
    UnknownIgd {},
    #[snafu(display("local host has no address usable for port mapping"))]
    NoHostAddress {},
    #[snafu(display("mapping request without an external port"))]
    ZeroExternalPort {},
    #[snafu(display("AddPortMapping failed"))]
    AddPort { source: AddPortError },
    #[snafu(display("DeletePortMapping failed"))]
    RemovePort { source: RemovePortError },
}

impl Error {
    /// Port conflicts are mapping-level failures the coordinator resolves by
    /// picking another port; they do not count against the IGD.
    fn is_conflict(&self) -> bool {
        match self {
            Error::AddPort {
                source: AddPortError::PortInUse,
                ..
            } => true,
            Error::AddPort {
                source: AddPortError::RequestError(RequestError::ErrorCode(code, _)),
                ..
            } => *code == SOAP_CONFLICT_IN_MAPPING,
            _ => false,
        }
    }

    /// Fatal errors count against the IGD until it is invalidated.
    fn is_fatal(&self) -> bool {
        if self.is_conflict() {
            return false;
        }
        match self {
            Error::RemovePort {
                source: RemovePortError::NoSuchPortMapping,
                ..
            } => false,
            Error::AddPort { .. }
            | Error::RemovePort { .. }
            | Error::Search { .. }
            | Error::SearchTimeout { .. }
            | Error::GetExternalIp { .. } => true,
            Error::NotIpv4 { .. }
            | Error::UnknownIgd { .. }
            | Error::NoHostAddress { .. }
            | Error::ZeroExternalPort { .. } => false,
        }
    }
}

/// Spawn the UPnP driver task and return the handle used to command it.
pub(crate) fn spawn(events: mpsc::Sender<ObserverEvent>, metrics: Arc<Metrics>) -> DriverHandle {
    let (tx, rx) = mpsc::channel(DRIVER_CHANNEL_CAPACITY);
    let driver = Driver {
        rx,
        events,
        metrics,
        igds: Vec::new(),
        host_address: None,
        search_attempts: 0,
        search_task: None,
    };
    let task = tokio::spawn(driver.run().instrument(info_span!("portkeeper.upnp")));
    DriverHandle::new(NatProtocol::Pupnp, tx, task)
}

/// A validated gateway together with its shared IGD record.
#[derive(derive_more::Debug)]
struct UpnpIgd {
    igd: SharedIgd,
    #[debug("{}", gateway)]
    gateway: Gateway,
    location: Url,
}

struct Driver {
    rx: mpsc::Receiver<DriverCmd>,
    events: mpsc::Sender<ObserverEvent>,
    metrics: Arc<Metrics>,
    igds: Vec<UpnpIgd>,
    host_address: Option<Ipv4Addr>,
    search_attempts: u32,
    search_task: Option<SearchTask>,
}

impl Driver {
    async fn run(mut self) {
        debug!("UPnP driver starting");
        let mut retry = RetryTimer::default();
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        trace!("tick: cmd {cmd:?}");
                        if self.handle_cmd(cmd, &mut retry).await {
                            break;
                        }
                    }
                    None => break,
                },
                res = MaybeFuture { inner: self.search_task.as_mut() } => {
                    self.search_task = None;
                    self.on_search_result(res, &mut retry).await;
                }
                _ = &mut retry => {
                    retry.inner = None;
                    self.start_search();
                }
            }
        }
        debug!("UPnP driver stopped");
    }

    /// Returns `true` when the driver should stop.
    async fn handle_cmd(&mut self, cmd: DriverCmd, retry: &mut RetryTimer) -> bool {
        match cmd {
            DriverCmd::SearchForIgd => {
                self.search_attempts = 0;
                self.start_search();
            }
            DriverCmd::ClearIgds => self.clear_igds(retry),
            DriverCmd::RequestMappingAdd(info) => self.request_mapping_add(info).await,
            DriverCmd::RequestMappingRenew(info) => {
                // Leases are requested permanent, there is nothing to renew.
                debug!("ignoring renewal request for mapping {info}");
            }
            DriverCmd::RequestMappingRemove(info) => self.request_mapping_remove(info).await,
            DriverCmd::ListRemoteMappings { igd } => self.list_remote_mappings(igd).await,
            DriverCmd::Terminate { done } => {
                self.clear_igds(retry);
                let _ = done.send(());
                debug!("UPnP driver terminated");
                return true;
            }
        }
        false
    }

    /// Launch an asynchronous gateway search unless one is already running.
    ///
    /// The search and the validation of the candidate run off-task; only the
    /// completion is handled here.
    fn start_search(&mut self) {
        if self.search_task.is_some() {
            return;
        }
        self.metrics.upnp_searches.inc();
        self.host_address = crate::ip_and_gateway()
            .ok()
            .map(|(ip, _)| ip)
            .filter(|ip| !ip.is_loopback());

        let task = tokio::spawn(
            async move {
                let gateway = time::timeout(
                    SEARCH_TIMEOUT,
                    aigd::tokio::search_gateway(igd_next::SearchOptions {
                        timeout: Some(SEARCH_TIMEOUT),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|_| SearchTimeoutSnafu.build())?
                .context(SearchSnafu)?;

                let external_ip = match gateway.get_external_ip().await.context(GetExternalIpSnafu)? {
                    IpAddr::V4(ip) if !ip.is_unspecified() => ip,
                    _ => return NotIpv4Snafu.fail(),
                };
                Ok((gateway, external_ip))
            }
            .instrument(info_span!("portkeeper.upnp.search")),
        );
        self.search_task = Some(AbortOnDropHandle::new(task));
    }

    async fn on_search_result(
        &mut self,
        res: Result<Result<(Gateway, Ipv4Addr), Error>, JoinError>,
        retry: &mut RetryTimer,
    ) {
        let adopted = match res {
            Ok(Ok((gateway, external_ip))) => self.adopt_gateway(gateway, external_ip).await,
            Ok(Err(e)) => {
                debug!("igd search failed: {e}");
                false
            }
            Err(e) => {
                debug!("igd search task failed: {e}");
                false
            }
        };
        if adopted {
            self.search_attempts = 0;
            return;
        }
        self.metrics.upnp_searches_failed.inc();
        self.search_attempts += 1;
        if self.search_attempts <= MAX_SEARCH_RETRIES {
            debug!("scheduling igd search attempt {}", self.search_attempts);
            retry.inner = Some(Box::pin(time::sleep(
                SEARCH_RETRY_UNIT * self.search_attempts,
            )));
        } else {
            warn!("igd search failed after {MAX_SEARCH_RETRIES} attempts, UPnP will be disabled");
        }
    }

    /// Validate a search result and announce it to the coordinator.
    async fn adopt_gateway(&mut self, gateway: Gateway, external_ip: Ipv4Addr) -> bool {
        // Invalidated gateways may be rediscovered in a healthier state.
        self.igds.retain(|entry| entry.igd.is_valid());

        let addr = match gateway.addr {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                debug!("ignoring IPv6 gateway {gateway}");
                return false;
            }
        };

        // A gateway outside the private ranges is not a LAN router. Refusing
        // it keeps foreign devices on bridged segments from being adopted.
        if !addr.ip().is_private() {
            warn!("ignoring gateway with non-private address {addr}");
            return false;
        }
        if let Ok((_, default_gw)) = crate::ip_and_gateway() {
            if default_gw != *addr.ip() {
                warn!(
                    "gateway {addr} is not the default gateway ({default_gw}), \
                     mapped ports may not be reachable"
                );
            }
        }

        let location = match Url::parse(&format!("http://{}{}", gateway.addr, gateway.root_url)) {
            Ok(url) => url,
            Err(e) => {
                warn!("gateway {gateway} has an unusable location: {e}");
                return false;
            }
        };

        if self
            .igds
            .iter()
            .any(|known| known.gateway.addr == gateway.addr && known.location == location)
        {
            debug!("gateway {gateway} is already known");
            return true;
        }

        let igd = Igd::shared(NatProtocol::Pupnp);
        igd.set_local_ip(Some(*addr.ip()));
        igd.set_public_ip(Some(external_ip));
        igd.set_uid(location.to_string());
        igd.set_valid(true);

        debug!("validated IGD {igd} at {location}");
        self.igds.push(UpnpIgd {
            igd: igd.clone(),
            gateway,
            location,
        });
        self.metrics.igd_added.inc();
        self.emit(ObserverEvent::IgdUpdated {
            igd,
            event: IgdEvent::Added,
        })
        .await;
        true
    }

    fn entry_for(&self, igd: &Option<SharedIgd>) -> Option<&UpnpIgd> {
        let igd = igd.as_ref()?;
        self.igds.iter().find(|entry| Arc::ptr_eq(&entry.igd, igd))
    }

    async fn request_mapping_add(&mut self, mut info: MappingInfo) {
        match self.add_port_mapping(&mut info).await {
            Ok(igd) => {
                debug!("request for mapping {info} succeeded");
                self.emit(ObserverEvent::MappingAdded { igd, result: info })
                    .await;
            }
            Err(e) => {
                warn!("request for mapping {info} failed: {e}");
                self.note_action_error(&info.igd, &e).await;
                self.emit(ObserverEvent::MappingRequestFailed { result: info })
                    .await;
            }
        }
    }

    async fn add_port_mapping(&self, info: &mut MappingInfo) -> Result<SharedIgd, Error> {
        let entry = self.entry_for(&info.igd).context(UnknownIgdSnafu)?;
        ensure!(entry.igd.is_valid(), UnknownIgdSnafu);
        ensure!(info.external_port != 0, ZeroExternalPortSnafu);
        let host = self.host_address.context(NoHostAddressSnafu)?;

        let local_addr = SocketAddrV4::new(host, info.internal_port);
        entry
            .gateway
            .add_port(
                family_protocol(info.family),
                info.external_port,
                local_addr.into(),
                PORT_MAPPING_LEASE_DURATION,
                &info.description(),
            )
            .await
            .context(AddPortSnafu)?;

        info.internal_addr = Some(host);
        info.igd = Some(entry.igd.clone());
        Ok(entry.igd.clone())
    }

    async fn request_mapping_remove(&mut self, info: MappingInfo) {
        match self.delete_port_mapping(&info).await {
            Ok(()) => debug!("mapping {info} removed"),
            Err(e) => {
                warn!("remove request for mapping {info} failed: {e}. Ignoring");
                self.note_action_error(&info.igd, &e).await;
            }
        }
        self.metrics.mapping_removals.inc();
        if let Some(igd) = info.igd.clone() {
            self.emit(ObserverEvent::MappingRemoved { igd, result: info })
                .await;
        }
    }

    async fn delete_port_mapping(&self, info: &MappingInfo) -> Result<(), Error> {
        let entry = self.entry_for(&info.igd).context(UnknownIgdSnafu)?;
        entry
            .gateway
            .remove_port(family_protocol(info.family), info.external_port)
            .await
            .context(RemovePortSnafu)
    }

    /// Enumerate the mappings this host owns on the IGD, keyed like the local
    /// table, and post the result to the coordinator.
    async fn list_remote_mappings(&mut self, target: SharedIgd) {
        let mut mappings: BTreeMap<MapKey, MappingInfo> = BTreeMap::new();

        if let (Some(entry), Some(host)) = (self.entry_for(&Some(target.clone())), self.host_address)
        {
            let mut index = 0u32;
            loop {
                match entry.gateway.get_generic_port_mapping_entry(index).await {
                    Ok(remote) => {
                        index += 1;
                        if remote.internal_client != IpAddr::V4(host).to_string() {
                            continue;
                        }
                        if !remote
                            .port_mapping_description
                            .starts_with(MAPPING_DESCRIPTION_PREFIX)
                        {
                            continue;
                        }
                        let info = MappingInfo {
                            family: match remote.protocol {
                                PortMappingProtocol::TCP => PortFamily::Tcp,
                                PortMappingProtocol::UDP => PortFamily::Udp,
                            },
                            internal_port: remote.internal_port,
                            external_port: remote.external_port,
                            internal_addr: Some(host),
                            renewal_time: None,
                            igd: Some(target.clone()),
                        };
                        mappings.insert(info.key(), info);
                    }
                    // End-of-list sentinels. Some routers incorrectly answer
                    // 718 instead of 713 past the last entry.
                    Err(GetGenericPortMappingEntryError::SpecifiedArrayIndexInvalid) => break,
                    Err(GetGenericPortMappingEntryError::RequestError(
                        RequestError::ErrorCode(code, _),
                    )) if code == SOAP_ARRAY_IDX_INVALID || code == SOAP_CONFLICT_IN_MAPPING => {
                        break
                    }
                    Err(e) => {
                        warn!("listing mappings failed at index {index}: {e}");
                        break;
                    }
                }
            }
            debug!("found {} locally-owned mappings on the IGD", mappings.len());
        }

        self.emit(ObserverEvent::RemoteMappingList {
            igd: target,
            mappings,
        })
        .await;
    }

    /// Record an action error against the IGD, invalidating it once the
    /// counter latches.
    async fn note_action_error(&mut self, igd: &Option<SharedIgd>, err: &Error) {
        if !err.is_fatal() {
            return;
        }
        let Some(igd) = igd else {
            return;
        };
        if !igd.is_valid() {
            return;
        }
        if !igd.increment_errors() {
            warn!("IGD {igd} accumulated too many errors");
            self.metrics.igd_invalidated.inc();
            self.emit(ObserverEvent::IgdUpdated {
                igd: igd.clone(),
                event: IgdEvent::InvalidState,
            })
            .await;
        }
    }

    fn clear_igds(&mut self, retry: &mut RetryTimer) {
        for entry in &self.igds {
            entry.igd.set_valid(false);
        }
        self.igds.clear();
        self.search_attempts = 0;
        self.search_task = None;
        retry.inner = None;
        self.host_address = None;
    }

    async fn emit(&self, event: ObserverEvent) {
        // Posting after the coordinator shut down is a cheap no-op.
        if self.events.send(event).await.is_err() {
            trace!("coordinator is gone, dropping event");
        }
    }
}

fn family_protocol(family: PortFamily) -> PortMappingProtocol {
    match family {
        PortFamily::Udp => PortMappingProtocol::UDP,
        PortFamily::Tcp => PortMappingProtocol::TCP,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_protocol_round_trips() {
        assert_eq!(family_protocol(PortFamily::Tcp), PortMappingProtocol::TCP);
        assert_eq!(family_protocol(PortFamily::Udp), PortMappingProtocol::UDP);
    }

    #[test]
    fn conflicts_do_not_count_against_the_igd() {
        let conflict = Error::AddPort {
            source: AddPortError::PortInUse,
            backtrace: None,
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_fatal());

        let soap_conflict = Error::AddPort {
            source: AddPortError::RequestError(RequestError::ErrorCode(
                SOAP_CONFLICT_IN_MAPPING,
                "ConflictInMappingEntry".into(),
            )),
            backtrace: None,
        };
        assert!(soap_conflict.is_conflict());
        assert!(!soap_conflict.is_fatal());

        let denied = Error::AddPort {
            source: AddPortError::ActionNotAuthorized,
            backtrace: None,
        };
        assert!(!denied.is_conflict());
        assert!(denied.is_fatal());
    }

    #[test]
    fn missing_remote_mapping_is_not_fatal() {
        let err = Error::RemovePort {
            source: RemovePortError::NoSuchPortMapping,
            backtrace: None,
        };
        assert!(!err.is_fatal());
    }
}
