// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stateful SIP proxy core.
//!
//! Downstream TCP connections are decoded into transactions, each driven
//! through a decoder filter chain terminated by the router. The router
//! resolves dialog affinity (through the shared cache and the traffic
//! routing assistant), picks an upstream cluster host, and dispatches over a
//! pooled connection; upstream responses are correlated back to their
//! downstream transaction by branch.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use sip_filter::{run_proxy, Cluster, ClusterManager, ProxyConfig, ProxyServices, Route};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let clusters = ClusterManager::new();
//! clusters.insert(Cluster::new("c1", vec!["10.0.0.5:5060".parse()?]));
//!
//! let mut config = ProxyConfig::default();
//! config.route_config.routes.push(Route::new("ex.com", "c1"));
//!
//! let services = Arc::new(ProxyServices::new(config, Arc::new(clusters), None));
//! run_proxy(services, "0.0.0.0:5060").await
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod conn_manager;
pub mod filters;
pub mod listener;
pub mod route;
pub mod router;
pub mod table;
pub mod upstream;

use std::sync::Arc;

use dashmap::DashMap;
use sip_msg::{FrameLimits, ParseOptions};
use sip_observe::ProxyStats;
use sip_tra::{AffinityCache, TraTransport};
use smol_str::SmolStr;

pub use cluster::{Cluster, ClusterManager, DefaultLbContext, Host, LbContext};
pub use config::{
    AffinityEntry, AffinitySource, FilterSpec, ProxyConfig, Route, RouteConfig, Settings,
    TraServiceConfig, ROUTER_FILTER_NAME,
};
pub use conn_manager::{ConnectionManager, DownstreamHandle, TransEvent};
pub use filters::{
    DecoderFilter, FilterContext, FilterFactory, FilterRegistry, FilterStatus, LocalReply, Stage,
};
pub use listener::{bind_listener, run_proxy, serve};
pub use route::{RouteEntry, RouteMatcher};
pub use router::Router;
pub use table::{TransactionInfo, TransactionInfoItem, AUDIT_INTERVAL};
pub use upstream::{ConnState, UpstreamRequest};

/// Shared services threaded through every connection: configuration, the
/// cluster registry, per-cluster transaction tables, the affinity cache,
/// statistics, and the filter registry.
pub struct ProxyServices {
    pub config: ProxyConfig,
    pub clusters: Arc<ClusterManager>,
    pub stats: Arc<ProxyStats>,
    pub affinity: Arc<AffinityCache>,
    pub matcher: RouteMatcher,
    pub registry: FilterRegistry,
    pub tra_transport: Option<Arc<dyn TraTransport>>,
    pub(crate) parse_options: ParseOptions,
    pub(crate) limits: FrameLimits,
    tables: DashMap<SmolStr, Arc<TransactionInfo>>,
}

impl ProxyServices {
    pub fn new(
        config: ProxyConfig,
        clusters: Arc<ClusterManager>,
        tra_transport: Option<Arc<dyn TraTransport>>,
    ) -> Self {
        let stats = Arc::new(ProxyStats::new(config.stat_prefix.clone()));
        let matcher = RouteMatcher::new(&config.route_config);
        let parse_options = ParseOptions {
            domain_match_param: (!config.settings.domain_match_parameter_name.is_empty())
                .then(|| SmolStr::new(&config.settings.domain_match_parameter_name)),
        };
        let limits = FrameLimits {
            max_body_bytes: config.settings.max_body_bytes,
            ..FrameLimits::default()
        };
        Self {
            config,
            clusters,
            stats,
            affinity: Arc::new(AffinityCache::new()),
            matcher,
            registry: FilterRegistry::with_builtin(),
            tra_transport,
            parse_options,
            limits,
            tables: DashMap::new(),
        }
    }

    /// The per-cluster transaction table, created (and its audit timer
    /// armed) on first use.
    pub fn table_for(&self, cluster: &str) -> Arc<TransactionInfo> {
        self.tables
            .entry(SmolStr::new(cluster))
            .or_insert_with(|| {
                TransactionInfo::new(
                    cluster,
                    self.config.settings.transaction_timeout,
                    self.stats.clone(),
                    self.limits,
                )
            })
            .clone()
    }

    /// The table for a cluster, when one has been created.
    pub fn existing_table(&self, cluster: &str) -> Option<Arc<TransactionInfo>> {
        self.tables.get(cluster).map(|entry| entry.value().clone())
    }
}
