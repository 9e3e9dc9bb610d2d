use iroh_metrics::{Counter, MetricsGroup};

/// Counters kept by the port mapping subsystem.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "portkeeper")]
pub struct Metrics {
    /*
     * Discovery metrics
     */
    /// NAT-PMP gateway probes sent.
    pub natpmp_probes: Counter,
    /// NAT-PMP gateway probes that found no usable gateway.
    pub natpmp_probes_failed: Counter,
    /// UPnP IGD searches started.
    pub upnp_searches: Counter,
    /// UPnP IGD searches that validated no gateway.
    pub upnp_searches_failed: Counter,
    /// IGDs added to the valid set.
    pub igd_added: Counter,
    /// IGDs that disappeared from the network.
    pub igd_removed: Counter,
    /// IGDs disabled after accumulating too many errors.
    pub igd_invalidated: Counter,

    /*
     * Mapping metrics
     */
    /// Port mapping requests dispatched to a driver.
    pub mapping_requests: Counter,
    /// Port mapping requests that failed.
    pub mapping_failures: Counter,
    /// NAT-PMP lease renewals performed.
    pub mapping_renewals: Counter,
    /// Port mappings removed from the gateway.
    pub mapping_removals: Counter,
    /// Stale mappings of previous instances deleted from the gateway.
    pub untracked_deletes: Counter,
}
