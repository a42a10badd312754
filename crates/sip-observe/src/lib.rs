// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Proxy statistics.
//!
//! Counters cover the full request/response lifecycle of the proxy: decoded
//! requests, forwarded responses, locally generated replies by kind,
//! connection teardown with active transactions, and every routing failure
//! mode. Counters are plain atomics so they can be read from tests and
//! scraped without locking.
//!
//! # Example
//! ```
//! use sip_observe::ProxyStats;
//! let stats = ProxyStats::new("ingress");
//! stats.request.inc();
//! assert_eq!(stats.snapshot().request, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing statistic.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters maintained by one proxy instance.
///
/// The names follow the emitted statistic names; `stat_prefix` scopes them
/// when several proxy instances run in one process.
#[derive(Debug, Default)]
pub struct ProxyStats {
    stat_prefix: String,

    /// Requests that completed the decoder filter chain.
    pub request: Counter,
    /// Upstream responses forwarded downstream.
    pub response: Counter,
    /// Local replies with a 2xx status.
    pub response_success: Counter,
    /// Local replies with an error status.
    pub response_error: Counter,
    /// Local replies generated from decode-level exceptions.
    pub response_exception: Counter,
    /// Upstream responses dropped because no transaction matched.
    pub response_decoding_error: Counter,
    /// Downstream connections closed locally with transactions in flight.
    pub cx_destroy_local_with_active_rq: Counter,
    /// Downstream connections closed by the peer with transactions in flight.
    pub cx_destroy_remote_with_active_rq: Counter,
    /// Requests with no matching route entry.
    pub route_missing: Counter,
    /// Requests whose route names a cluster that does not exist.
    pub unknown_cluster: Counter,
    /// Requests rejected because the cluster is in maintenance mode.
    pub upstream_rq_maintenance_mode: Counter,
    /// Requests with no healthy, acceptable upstream host.
    pub no_healthy_upstream: Counter,
}

impl ProxyStats {
    pub fn new(stat_prefix: impl Into<String>) -> Self {
        Self {
            stat_prefix: stat_prefix.into(),
            ..Default::default()
        }
    }

    pub fn stat_prefix(&self) -> &str {
        &self.stat_prefix
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            request: self.request.get(),
            response: self.response.get(),
            response_success: self.response_success.get(),
            response_error: self.response_error.get(),
            response_exception: self.response_exception.get(),
            response_decoding_error: self.response_decoding_error.get(),
            cx_destroy_local_with_active_rq: self.cx_destroy_local_with_active_rq.get(),
            cx_destroy_remote_with_active_rq: self.cx_destroy_remote_with_active_rq.get(),
            route_missing: self.route_missing.get(),
            unknown_cluster: self.unknown_cluster.get(),
            upstream_rq_maintenance_mode: self.upstream_rq_maintenance_mode.get(),
            no_healthy_upstream: self.no_healthy_upstream.get(),
        }
    }
}

/// Frozen view of [`ProxyStats`], for assertions and periodic export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub request: u64,
    pub response: u64,
    pub response_success: u64,
    pub response_error: u64,
    pub response_exception: u64,
    pub response_decoding_error: u64,
    pub cx_destroy_local_with_active_rq: u64,
    pub cx_destroy_remote_with_active_rq: u64,
    pub route_missing: u64,
    pub unknown_cluster: u64,
    pub upstream_rq_maintenance_mode: u64,
    pub no_healthy_upstream: u64,
}

/// Creates a tracing span scoped to one downstream connection.
pub fn span_with_connection(name: &'static str, peer: &str) -> tracing::Span {
    tracing::span!(tracing::Level::INFO, "connection", op = name, peer = peer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let stats = ProxyStats::new("test");
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
        stats.request.inc();
        stats.request.inc();
        stats.no_healthy_upstream.inc();
        let snap = stats.snapshot();
        assert_eq!(snap.request, 2);
        assert_eq!(snap.no_healthy_upstream, 1);
        assert_eq!(snap.response, 0);
    }

    #[test]
    fn keeps_stat_prefix() {
        assert_eq!(ProxyStats::new("egress").stat_prefix(), "egress");
    }
}
