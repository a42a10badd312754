// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Upstream clusters and host selection.
//!
//! A cluster is a named set of upstream hosts with a round-robin balancer.
//! Selection consults the caller through [`LbContext`], which lets the
//! router pin the pick to an affinity destination by vetoing every other
//! host.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use smol_str::SmolStr;

/// One upstream endpoint.
#[derive(Debug)]
pub struct Host {
    addr: SocketAddr,
    healthy: AtomicBool,
}

impl Host {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            healthy: AtomicBool::new(true),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Address rendered for destination comparison and table keys.
    pub fn address_string(&self) -> String {
        self.addr.to_string()
    }

    /// Whether this host is the one an affinity destination names.
    /// Destinations may carry a bare IP or an `ip:port` pair.
    pub fn matches_destination(&self, destination: &str) -> bool {
        self.addr.to_string() == destination || self.addr.ip().to_string() == destination
    }
}

/// Selection-time context supplied by the caller of [`Cluster::pick`].
pub trait LbContext {
    /// Returns true to veto the offered host and move on to the next one.
    fn should_select_another_host(&self, host: &Host) -> bool {
        let _ = host;
        false
    }

    /// Criteria carried from the matched route; unused by the round-robin
    /// balancer but available to custom ones.
    fn metadata_match(&self) -> Option<&[(SmolStr, SmolStr)]> {
        None
    }
}

/// Context that accepts whichever host round-robin offers.
pub struct DefaultLbContext;

impl LbContext for DefaultLbContext {}

/// A named set of upstream hosts.
#[derive(Debug)]
pub struct Cluster {
    name: SmolStr,
    hosts: RwLock<Vec<Arc<Host>>>,
    next: AtomicUsize,
    maintenance: AtomicBool,
}

impl Cluster {
    pub fn new(name: impl Into<SmolStr>, addrs: Vec<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            hosts: RwLock::new(addrs.into_iter().map(Host::new).collect()),
            next: AtomicUsize::new(0),
            maintenance: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn add_host(&self, addr: SocketAddr) {
        self.hosts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Host::new(addr));
    }

    pub fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::Relaxed);
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Relaxed)
    }

    /// Round-robin pick skipping unhealthy hosts and hosts the context
    /// vetoes. Returns None when every host is skipped.
    pub fn pick(&self, ctx: &dyn LbContext) -> Option<Arc<Host>> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        if hosts.is_empty() {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for i in 0..hosts.len() {
            let host = &hosts[(start + i) % hosts.len()];
            if !host.is_healthy() {
                continue;
            }
            if ctx.should_select_another_host(host) {
                continue;
            }
            return Some(host.clone());
        }
        None
    }
}

/// Registry of clusters addressable by route entries.
#[derive(Debug, Default)]
pub struct ClusterManager {
    clusters: DashMap<SmolStr, Arc<Cluster>>,
}

impl ClusterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cluster: Arc<Cluster>) {
        self.clusters.insert(SmolStr::new(cluster.name()), cluster);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).map(|entry| entry.value().clone())
    }
}
