//! NAT-PMP protocol driver.
//!
//! Talks to at most one IGD, the default IPv4 gateway, since NAT-PMP has no
//! discovery. All gateway traffic happens on a dedicated task owning the
//! socket; results are posted back to the coordinator as observer events.

use std::{net::Ipv4Addr, pin::Pin, sync::Arc, time::Duration};

use nested_enum_utils::common_fields;
use netwatch::UdpSocket;
use smallvec::SmallVec;
use snafu::{ensure, Backtrace, OptionExt, Snafu};
use tokio::{
    sync::mpsc,
    time::{self, Instant, Sleep},
};
use tracing::{debug, info_span, trace, warn, Instrument};

use self::protocol::MapProtocol;
use crate::{
    defaults::NAT_PMP_RECV_TIMEOUT as RECV_TIMEOUT,
    igd::{Igd, IgdEvent, NatProtocol, SharedIgd},
    mapping::{MappingInfo, PortFamily},
    metrics::Metrics,
    service::{DriverCmd, DriverHandle, ObserverEvent, DRIVER_CHANNEL_CAPACITY},
    util::MaybeFuture,
    Config,
};

mod protocol;

/// Lifetime requested for every allocation. Renewal happens at 4/5 of the
/// lifetime the gateway actually grants.
const ALLOCATION_LIFETIME_SECONDS: u32 = 60 * 60;

/// How many times a read is retried before the request is abandoned.
const MAX_READ_RETRIES: u32 = 3;

/// Spacing between two read retries.
const READ_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Gateway setup attempts before NAT-PMP gives up until the next search.
const MAX_SEARCH_RETRIES: u32 = 3;

/// Base unit of the backoff between gateway setup attempts.
const SEARCH_RETRY_UNIT: Duration = Duration::from_secs(10);

/// NAT-PMP has no device identifiers, the single gateway gets a fixed one.
const GATEWAY_UID: &str = "NAT-PMP Gateway";

type RetryTimer = MaybeFuture<Pin<Box<Sleep>>>;

#[common_fields({
    backtrace: Option<Backtrace>
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("no usable gateway for NAT-PMP"))]
    NoGateway {},
    #[snafu(display("local host has no address usable for port mapping"))]
    NoHostAddress {},
    #[snafu(display("the gateway did not respond"))]
    NoResponse {},
    #[snafu(display("server returned an unexpected response for the request"))]
    UnexpectedServerResponse {},
    #[snafu(display("timed out waiting for the gateway"))]
    ReadTimeout {},
    #[snafu(display("request issued against an invalid gateway"))]
    GatewayInvalid {},
    #[snafu(transparent)]
    Io { source: std::io::Error },
    #[snafu(transparent)]
    Protocol { source: protocol::Error },
}

impl Error {
    /// Fatal errors count against the gateway until it is invalidated.
    fn is_fatal(&self) -> bool {
        match self {
            Error::Io { .. } | Error::NoGateway { .. } | Error::NoResponse { .. } => true,
            Error::Protocol { source, .. } => source.is_fatal(),
            Error::NoHostAddress { .. }
            | Error::UnexpectedServerResponse { .. }
            | Error::ReadTimeout { .. }
            | Error::GatewayInvalid { .. } => false,
        }
    }
}

/// Spawn the NAT-PMP driver task and return the handle used to command it.
pub(crate) fn spawn(
    config: &Config,
    events: mpsc::Sender<ObserverEvent>,
    metrics: Arc<Metrics>,
) -> DriverHandle {
    let (tx, rx) = mpsc::channel(DRIVER_CHANNEL_CAPACITY);
    let driver = Driver {
        gateway_override: config.natpmp_gateway,
        server_port: config.natpmp_server_port,
        rx,
        events,
        metrics,
        igd: Igd::shared(NatProtocol::NatPmp),
        socket: None,
        host_address: None,
        initialized: false,
        search_attempts: 0,
    };
    let task = tokio::spawn(driver.run().instrument(info_span!("portkeeper.natpmp")));
    DriverHandle::new(NatProtocol::NatPmp, tx, task)
}

struct Driver {
    gateway_override: Option<Ipv4Addr>,
    server_port: u16,
    rx: mpsc::Receiver<DriverCmd>,
    events: mpsc::Sender<ObserverEvent>,
    metrics: Arc<Metrics>,
    igd: SharedIgd,
    socket: Option<UdpSocket>,
    host_address: Option<Ipv4Addr>,
    initialized: bool,
    search_attempts: u32,
}

impl Driver {
    async fn run(mut self) {
        debug!("NAT-PMP driver starting");
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
                _ = &mut retry => {
                    retry.inner = None;
                    self.search_for_igd(&mut retry).await;
                }
            }
        }
        debug!("NAT-PMP driver stopped");
    }

    /// Returns `true` when the driver should stop.
    async fn handle_cmd(&mut self, cmd: DriverCmd, retry: &mut RetryTimer) -> bool {
        match cmd {
            DriverCmd::SearchForIgd => {
                self.search_attempts = 0;
                self.search_for_igd(retry).await;
            }
            DriverCmd::ClearIgds => self.clear_igds(retry),
            DriverCmd::RequestMappingAdd(info) => self.request_mapping_add(info).await,
            DriverCmd::RequestMappingRenew(info) => self.request_mapping_renew(info).await,
            DriverCmd::RequestMappingRemove(info) => self.request_mapping_remove(info).await,
            DriverCmd::ListRemoteMappings { .. } => {
                // NAT-PMP cannot enumerate mappings; stale allocations expire
                // on their own when not renewed.
                trace!("ignoring remote mapping list request");
            }
            DriverCmd::Terminate { done } => {
                self.terminate().await;
                let _ = done.send(());
                return true;
            }
        }
        false
    }

    async fn search_for_igd(&mut self, retry: &mut RetryTimer) {
        if !self.initialized {
            self.metrics.natpmp_probes.inc();
            if let Err(e) = self.init().await {
                self.metrics.natpmp_probes_failed.inc();
                warn!("gateway setup failed: {e}");
                self.note_error(&e).await;
            }
        }
        if self.initialized {
            self.search_attempts = 0;
            return;
        }
        self.search_attempts += 1;
        if self.search_attempts <= MAX_SEARCH_RETRIES {
            debug!("scheduling gateway setup attempt {}", self.search_attempts);
            retry.inner = Some(Box::pin(time::sleep(
                SEARCH_RETRY_UNIT * self.search_attempts,
            )));
        } else {
            warn!("gateway setup failed after {MAX_SEARCH_RETRIES} attempts, NAT-PMP will be disabled");
        }
    }

    async fn init(&mut self) -> Result<(), Error> {
        self.initialized = false;

        if self.igd.is_valid() {
            self.igd.set_valid(false);
            self.emit_igd_event(IgdEvent::Removed).await;
        }
        self.igd.set_local_ip(None);
        self.igd.set_public_ip(None);
        self.igd.set_uid("");

        let detected = crate::ip_and_gateway().ok();

        let mut candidates: SmallVec<[Ipv4Addr; 2]> = SmallVec::new();
        if let Some(gateway) = self.gateway_override {
            candidates.push(gateway);
        }
        if let Some((_, gateway)) = detected {
            if Some(gateway) != self.gateway_override {
                candidates.push(gateway);
            }
        }
        ensure!(!candidates.is_empty(), NoGatewaySnafu);

        let mut last_err = None;
        for gateway in candidates {
            match self.try_gateway(gateway, detected.map(|(ip, _)| ip)).await {
                Ok(public_ip) => {
                    self.igd.set_local_ip(Some(gateway));
                    self.igd.set_public_ip(Some(public_ip));
                    self.igd.set_uid(GATEWAY_UID);
                    self.igd.set_valid(true);
                    self.initialized = true;
                    debug!("gateway {gateway} reports public address {public_ip}");
                    // Flush allocations left behind by previous instances.
                    self.remove_all().await;
                    self.emit_igd_event(IgdEvent::Added).await;
                    return Ok(());
                }
                Err(e) => {
                    debug!("gateway {gateway} probe failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| NoGatewaySnafu.build()))
    }

    /// Probe one gateway candidate for its public address and keep the
    /// socket when it answers.
    async fn try_gateway(
        &mut self,
        gateway: Ipv4Addr,
        detected_local: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, Error> {
        let local_ip = if gateway.is_loopback() {
            Ipv4Addr::LOCALHOST
        } else {
            let local = detected_local.context(NoHostAddressSnafu)?;
            ensure!(!local.is_loopback(), NoHostAddressSnafu);
            local
        };

        let socket = UdpSocket::bind_full((local_ip, 0))?;
        socket.connect((gateway, self.server_port).into())?;

        let response = self.request(&socket, &protocol::Request::ExternalAddress).await?;
        let protocol::Response::PublicAddress { public_ip, .. } = response else {
            return UnexpectedServerResponseSnafu.fail();
        };

        self.socket = Some(socket);
        self.host_address = Some(local_ip);
        Ok(public_ip)
    }

    async fn request_mapping_add(&mut self, mut info: MappingInfo) {
        match self.add_port_mapping(&mut info).await {
            Ok(()) => {
                debug!("request for mapping {info} succeeded");
                self.emit(ObserverEvent::MappingAdded {
                    igd: self.igd.clone(),
                    result: info,
                })
                .await;
            }
            Err(e) => {
                warn!("request for mapping {info} failed: {e}");
                self.note_error(&e).await;
                self.emit(ObserverEvent::MappingRequestFailed { result: info })
                    .await;
            }
        }
    }

    async fn request_mapping_renew(&mut self, mut info: MappingInfo) {
        match self.add_port_mapping(&mut info).await {
            Ok(()) => {
                debug!("renewal of mapping {info} succeeded");
                self.metrics.mapping_renewals.inc();
                self.emit(ObserverEvent::MappingRenewed {
                    igd: self.igd.clone(),
                    result: info,
                })
                .await;
            }
            Err(e) => {
                warn!("renewal of mapping {info} failed: {e}");
                self.note_error(&e).await;
                self.emit(ObserverEvent::MappingRequestFailed { result: info })
                    .await;
            }
        }
    }

    /// Issue a mapping request and fill `info` with the granted data.
    async fn add_port_mapping(&self, info: &mut MappingInfo) -> Result<(), Error> {
        ensure!(self.igd.is_valid(), GatewayInvalidSnafu);
        let socket = self.socket.as_ref().context(GatewayInvalidSnafu)?;

        let req = protocol::Request::Mapping {
            proto: map_protocol(info.family),
            local_port: info.internal_port,
            external_port: info.external_port,
            lifetime_seconds: ALLOCATION_LIFETIME_SECONDS,
        };
        let response = self.request(socket, &req).await?;
        let protocol::Response::PortMap {
            external_port,
            lifetime_seconds,
            ..
        } = response
        else {
            return UnexpectedServerResponseSnafu.fail();
        };

        info.external_port = external_port;
        info.internal_addr = self.host_address;
        info.renewal_time =
            Some(Instant::now() + Duration::from_secs(u64::from(lifetime_seconds) * 4 / 5));
        info.igd = Some(self.igd.clone());
        Ok(())
    }

    async fn request_mapping_remove(&mut self, mut info: MappingInfo) {
        if self.igd.is_valid() {
            if let Some(socket) = self.socket.as_ref() {
                // Deletions zero the suggested external port and the lifetime.
                let req = protocol::Request::Mapping {
                    proto: map_protocol(info.family),
                    local_port: info.internal_port,
                    external_port: 0,
                    lifetime_seconds: 0,
                };
                match self.request(socket, &req).await {
                    Ok(_) => debug!("mapping {info} removed"),
                    Err(e) => warn!("remove request for mapping {info} failed: {e}. Ignoring"),
                }
            }
        }
        self.metrics.mapping_removals.inc();
        info.igd = Some(self.igd.clone());
        self.emit(ObserverEvent::MappingRemoved {
            igd: self.igd.clone(),
            result: info,
        })
        .await;
    }

    /// Ask the gateway to drop every mapping of both families.
    async fn remove_all(&self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        for proto in [MapProtocol::Tcp, MapProtocol::Udp] {
            let req = protocol::Request::Mapping {
                proto,
                local_port: 0,
                external_port: 0,
                lifetime_seconds: 0,
            };
            if let Err(e) = self.request(socket, &req).await {
                warn!("remove-all ({proto:?}) request failed: {e}. Ignoring");
            }
        }
    }

    /// Send a request and read its matching response, skipping unrelated
    /// datagrams and re-reading on timeouts.
    async fn request(
        &self,
        socket: &UdpSocket,
        req: &protocol::Request,
    ) -> Result<protocol::Response, Error> {
        socket.send(&req.encode()).await?;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.read_response(socket).await {
                Ok(response) if response_matches(req, &response) => return Ok(response),
                Ok(response) => {
                    trace!("skipping unexpected response {response:?}");
                    if attempts >= MAX_READ_RETRIES {
                        return UnexpectedServerResponseSnafu.fail();
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if attempts >= MAX_READ_RETRIES {
                        return match e {
                            Error::ReadTimeout { .. } => NoResponseSnafu.fail(),
                            other => Err(other),
                        };
                    }
                    trace!("re-reading after {e}");
                    time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn read_response(&self, socket: &UdpSocket) -> Result<protocol::Response, Error> {
        let mut buffer = vec![0; protocol::Response::MAX_SIZE];
        let read = time::timeout(RECV_TIMEOUT, socket.recv(&mut buffer))
            .await
            .map_err(|_| ReadTimeoutSnafu.build())??;
        Ok(protocol::Response::decode(&buffer[..read])?)
    }

    /// Record a fatal error against the gateway, invalidating it once the
    /// counter latches.
    async fn note_error(&mut self, err: &Error) {
        if !err.is_fatal() || !self.igd.is_valid() {
            return;
        }
        if !self.igd.increment_errors() {
            warn!("no more valid NAT-PMP gateway");
            self.initialized = false;
            self.metrics.igd_invalidated.inc();
            self.emit(ObserverEvent::IgdUpdated {
                igd: self.igd.clone(),
                event: IgdEvent::InvalidState,
            })
            .await;
        }
    }

    fn clear_igds(&mut self, retry: &mut RetryTimer) {
        if self.igd.is_valid() {
            self.igd.set_valid(false);
        }
        self.initialized = false;
        self.search_attempts = 0;
        retry.inner = None;
        self.socket = None;
        self.host_address = None;
    }

    async fn terminate(&mut self) {
        // Best effort: the shutdown grace period covers these datagrams, and
        // a gateway that is already gone simply never answers.
        if self.initialized {
            self.remove_all().await;
        }
        self.igd.set_valid(false);
        self.socket = None;
        self.initialized = false;
        debug!("NAT-PMP driver terminated");
    }

    async fn emit_igd_event(&self, event: IgdEvent) {
        match event {
            IgdEvent::Added => {
                self.metrics.igd_added.inc();
            }
            IgdEvent::Removed => {
                self.metrics.igd_removed.inc();
            }
            IgdEvent::InvalidState => {}
        }
        self.emit(ObserverEvent::IgdUpdated {
            igd: self.igd.clone(),
            event,
        })
        .await;
    }

    async fn emit(&self, event: ObserverEvent) {
        // Posting after the coordinator shut down is a cheap no-op.
        if self.events.send(event).await.is_err() {
            trace!("coordinator is gone, dropping event");
        }
    }
}

fn map_protocol(family: PortFamily) -> MapProtocol {
    match family {
        PortFamily::Udp => MapProtocol::Udp,
        PortFamily::Tcp => MapProtocol::Tcp,
    }
}

fn response_matches(req: &protocol::Request, response: &protocol::Response) -> bool {
    match (req, response) {
        (protocol::Request::ExternalAddress, protocol::Response::PublicAddress { .. }) => true,
        (
            protocol::Request::Mapping {
                proto, local_port, ..
            },
            protocol::Response::PortMap {
                proto: response_proto,
                private_port,
                ..
            },
        ) => proto == response_proto && local_port == private_port,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;
    use tokio_util::task::AbortOnDropHandle;

    use super::*;

    /// A minimal NAT-PMP server on loopback.
    ///
    /// Grants every mapping with `map_lifetime`, unless `fail_code` is set,
    /// in which case mapping requests are answered with that result code.
    async fn fake_gateway(
        map_lifetime: u32,
        fail_code: Option<u16>,
    ) -> (u16, AbortOnDropHandle<()>) {
        let socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind fake gateway");
        let port = socket.local_addr().expect("local addr").port();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                if len < 2 || buf[0] != 0 {
                    continue;
                }
                let mut resp = Vec::with_capacity(16);
                match buf[1] {
                    0 => {
                        resp.extend_from_slice(&[0, 128, 0, 0]);
                        resp.extend_from_slice(&7u32.to_be_bytes());
                        resp.extend_from_slice(&[203, 0, 113, 7]);
                    }
                    op @ (1 | 2) if len >= 12 => {
                        let requested_lifetime =
                            u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
                        let code = if requested_lifetime == 0 {
                            0
                        } else {
                            fail_code.unwrap_or(0)
                        };
                        let granted = if requested_lifetime == 0 { 0 } else { map_lifetime };
                        resp.extend_from_slice(&[0, 128 + op]);
                        resp.extend_from_slice(&code.to_be_bytes());
                        resp.extend_from_slice(&7u32.to_be_bytes());
                        resp.extend_from_slice(&buf[4..8]); // echo both ports
                        resp.extend_from_slice(&granted.to_be_bytes());
                    }
                    _ => continue,
                }
                let _ = socket.send_to(&resp, from).await;
            }
        });
        (port, AbortOnDropHandle::new(task))
    }

    fn test_driver(
        server_port: u16,
    ) -> (DriverHandle, mpsc::Receiver<ObserverEvent>) {
        let (events_tx, events_rx) = mpsc::channel(32);
        let config = Config {
            natpmp_gateway: Some(Ipv4Addr::LOCALHOST),
            natpmp_server_port: server_port,
            ..Default::default()
        };
        let handle = spawn(&config, events_tx, Arc::new(Metrics::default()));
        (handle, events_rx)
    }

    #[tokio::test]
    #[ntest::timeout(30_000)]
    async fn probe_map_renew_remove() {
        let (port, _gateway) = fake_gateway(3600, None).await;
        let (handle, mut events) = test_driver(port);

        handle.send(DriverCmd::SearchForIgd);
        let igd = match events.recv().await.expect("driver event") {
            ObserverEvent::IgdUpdated { igd, event } => {
                assert_eq!(event, IgdEvent::Added);
                igd
            }
            other => panic!("expected IgdUpdated, got {other:?}"),
        };
        assert!(igd.is_valid());
        assert_eq!(igd.protocol(), NatProtocol::NatPmp);
        assert_eq!(igd.local_ip(), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(igd.public_ip(), Some(Ipv4Addr::new(203, 0, 113, 7)));

        let info = MappingInfo {
            family: PortFamily::Udp,
            internal_port: 20123,
            external_port: 20123,
            internal_addr: None,
            renewal_time: None,
            igd: Some(igd.clone()),
        };
        let before = Instant::now();
        handle.send(DriverCmd::RequestMappingAdd(info));
        let result = match events.recv().await.expect("driver event") {
            ObserverEvent::MappingAdded { result, .. } => result,
            other => panic!("expected MappingAdded, got {other:?}"),
        };
        assert_eq!(result.external_port, 20123);
        assert_eq!(result.internal_addr, Some(Ipv4Addr::LOCALHOST));
        let renewal = result.renewal_time.expect("renewal time set");
        let expected = before + Duration::from_secs(3600 * 4 / 5);
        assert!(renewal >= expected);
        assert!(renewal <= expected + Duration::from_secs(2));

        handle.send(DriverCmd::RequestMappingRenew(result.clone()));
        match events.recv().await.expect("driver event") {
            ObserverEvent::MappingRenewed { result, .. } => {
                assert_eq!(result.internal_port, 20123);
                assert!(result.renewal_time.is_some());
            }
            other => panic!("expected MappingRenewed, got {other:?}"),
        }

        handle.send(DriverCmd::RequestMappingRemove(result));
        match events.recv().await.expect("driver event") {
            ObserverEvent::MappingRemoved { result, .. } => {
                assert_eq!(result.internal_port, 20123)
            }
            other => panic!("expected MappingRemoved, got {other:?}"),
        }

        let (done_tx, done_rx) = oneshot::channel();
        handle.send(DriverCmd::Terminate { done: done_tx });
        time::timeout(Duration::from_secs(10), done_rx)
            .await
            .expect("terminate within the grace period")
            .expect("terminate acked");
    }

    #[tokio::test]
    #[ntest::timeout(30_000)]
    async fn server_failures_count_against_the_gateway() {
        // result code 3: network failure, a fatal error
        let (port, _gateway) = fake_gateway(3600, Some(3)).await;
        let (handle, mut events) = test_driver(port);

        handle.send(DriverCmd::SearchForIgd);
        let igd = match events.recv().await.expect("driver event") {
            ObserverEvent::IgdUpdated { igd, .. } => igd,
            other => panic!("expected IgdUpdated, got {other:?}"),
        };
        assert_eq!(igd.errors_count(), 0);

        let info = MappingInfo {
            family: PortFamily::Tcp,
            internal_port: 10123,
            external_port: 10123,
            internal_addr: None,
            renewal_time: None,
            igd: Some(igd.clone()),
        };
        handle.send(DriverCmd::RequestMappingAdd(info));
        match events.recv().await.expect("driver event") {
            ObserverEvent::MappingRequestFailed { result } => {
                assert_eq!(result.internal_port, 10123)
            }
            other => panic!("expected MappingRequestFailed, got {other:?}"),
        }
        assert_eq!(igd.errors_count(), 1);
        assert!(igd.is_valid());
    }
}
