// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Static proxy configuration.
//!
//! Plain data structures mirroring the filter's wire-format configuration:
//! a stat prefix, proxy settings, the route table, and the named decoder
//! filters making up each transaction's chain. The host that embeds the
//! proxy constructs these programmatically; the daemon layers CLI and JSON
//! parsing on top.

use std::time::Duration;

use sip_msg::decoder::DEFAULT_MAX_BODY_BYTES;

/// Name under which the terminal routing filter is registered.
pub const ROUTER_FILTER_NAME: &str = "router";

/// Top-level configuration for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub stat_prefix: String,
    pub settings: Settings,
    pub route_config: RouteConfig,
    /// Ordered decoder filters; the router is appended when absent.
    pub filters: Vec<FilterSpec>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            stat_prefix: "sip".into(),
            settings: Settings::default(),
            route_config: RouteConfig::default(),
            filters: vec![FilterSpec::router()],
        }
    }
}

/// Proxy-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Domain this proxy considers its own.
    pub own_domain: String,
    /// Name of the top-Route URI parameter that carries the matching domain,
    /// when the deployment encodes it there instead of the Route host.
    pub domain_match_parameter_name: String,
    /// Age at which an untouched transaction is reset by the audit sweep.
    pub transaction_timeout: Duration,
    /// Content-Length cap; larger bodies are rejected as oversize.
    pub max_body_bytes: usize,
    /// Affinity key sources consulted in order by the router.
    pub customized_affinity: Vec<AffinityEntry>,
    /// Traffic routing assistant wiring; affinity lookups are skipped
    /// entirely when absent.
    pub tra: Option<TraServiceConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            own_domain: String::new(),
            domain_match_parameter_name: String::new(),
            transaction_timeout: Duration::from_secs(32),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            customized_affinity: Vec::new(),
            tra: None,
        }
    }
}

/// Traffic routing assistant service settings.
#[derive(Debug, Clone)]
pub struct TraServiceConfig {
    /// Per-request deadline; an elapsed deadline degrades to an affinity
    /// miss.
    pub request_timeout: Duration,
}

impl Default for TraServiceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(2000),
        }
    }
}

/// Which metadata field supplies the affinity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinitySource {
    /// `p-cookie` parameter of the top Route URI.
    PCookie,
    /// `ep` parameter of the top Route URI.
    RouteEp,
    /// `opaque` parameter of the top Route URI.
    RouteOpaque,
}

/// One customized-affinity entry: where the key comes from and the key space
/// it is looked up in at the routing assistant.
#[derive(Debug, Clone)]
pub struct AffinityEntry {
    pub source: AffinitySource,
    pub key_name: String,
}

impl AffinityEntry {
    pub fn new(source: AffinitySource, key_name: impl Into<String>) -> Self {
        Self {
            source,
            key_name: key_name.into(),
        }
    }
}

/// Static route table.
#[derive(Debug, Clone, Default)]
pub struct RouteConfig {
    pub routes: Vec<Route>,
}

/// One route: a domain predicate and the cluster it selects.
#[derive(Debug, Clone)]
pub struct Route {
    /// Domain matched against the message; `*` matches everything.
    pub domain: String,
    pub cluster: String,
    /// Criteria forwarded to the load balancer context.
    pub metadata_match: Vec<(String, String)>,
}

impl Route {
    pub fn new(domain: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            cluster: cluster.into(),
            metadata_match: Vec::new(),
        }
    }
}

/// A named decoder filter in the per-transaction chain.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub name: String,
}

impl FilterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn router() -> Self {
        Self::new(ROUTER_FILTER_NAME)
    }
}
