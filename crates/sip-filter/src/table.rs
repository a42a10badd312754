// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-cluster transaction and upstream-request tables.
//!
//! Every cluster owns a [`TransactionInfo`]: the transaction table through
//! which upstream responses find their originating downstream transaction,
//! and the pool of per-host upstream requests. A periodic audit sweep erases
//! tombstoned entries and resets transactions older than the configured
//! timeout. A timed-out entry is only tombstoned by the reset path and
//! erased on a later tick, so callbacks re-entering the table never race an
//! eager erase.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sip_msg::FrameLimits;
use sip_observe::ProxyStats;
use smol_str::SmolStr;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::cluster::Host;
use crate::conn_manager::DownstreamHandle;
use crate::upstream::{ConnState, UpstreamRequest};

/// Period of the audit sweep.
pub const AUDIT_INTERVAL: Duration = Duration::from_secs(2);

/// One registered transaction: the handle back to its downstream connection
/// and the upstream request it is pinned to.
#[derive(Debug)]
pub struct TransactionInfoItem {
    transaction_id: SmolStr,
    downstream: DownstreamHandle,
    upstream: Arc<UpstreamRequest>,
    created_at: Instant,
    deleted: AtomicBool,
}

impl TransactionInfoItem {
    pub fn new(
        transaction_id: SmolStr,
        downstream: DownstreamHandle,
        upstream: Arc<UpstreamRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transaction_id,
            downstream,
            upstream,
            created_at: Instant::now(),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn transaction_id(&self) -> &SmolStr {
        &self.transaction_id
    }

    pub fn downstream(&self) -> &DownstreamHandle {
        &self.downstream
    }

    pub fn upstream(&self) -> &Arc<UpstreamRequest> {
        &self.upstream
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Tombstones the item; the next audit sweep erases it. Lookups treat a
    /// tombstoned item as absent.
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Resets the owning transaction exactly once: tombstones the item and
    /// notifies the downstream connection.
    pub fn reset(&self) {
        if !self.deleted.swap(true, Ordering::SeqCst) {
            self.downstream.notify_reset(&self.transaction_id);
        }
    }

    /// Fails the owning transaction exactly once with an upstream error.
    pub fn fail(&self, error: &str) {
        if !self.deleted.swap(true, Ordering::SeqCst) {
            self.downstream
                .notify_upstream_failed(&self.transaction_id, error);
        }
    }
}

/// Per-cluster transaction table, upstream-request pool, and audit timer.
#[derive(Debug)]
pub struct TransactionInfo {
    cluster_name: SmolStr,
    transaction_timeout: Duration,
    transactions: DashMap<SmolStr, Arc<TransactionInfoItem>>,
    upstream_requests: DashMap<SocketAddr, Arc<UpstreamRequest>>,
    stats: Arc<ProxyStats>,
    limits: FrameLimits,
    weak_self: std::sync::Weak<TransactionInfo>,
    audit_task: Mutex<Option<AbortHandle>>,
}

impl TransactionInfo {
    /// Creates the table and arms its audit timer.
    pub fn new(
        cluster_name: &str,
        transaction_timeout: Duration,
        stats: Arc<ProxyStats>,
        limits: FrameLimits,
    ) -> Arc<Self> {
        let info = Arc::new_cyclic(|weak| Self {
            cluster_name: SmolStr::new(cluster_name),
            transaction_timeout,
            transactions: DashMap::new(),
            upstream_requests: DashMap::new(),
            stats,
            limits,
            weak_self: weak.clone(),
            audit_task: Mutex::new(None),
        });
        let weak = Arc::downgrade(&info);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUDIT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(info) = weak.upgrade() else { break };
                info.audit_sweep();
            }
        })
        .abort_handle();
        *info
            .audit_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Registers a transaction. An already-indexed id keeps its existing
    /// item; re-sends of the same transaction never re-pin it.
    pub fn insert_transaction(&self, item: Arc<TransactionInfoItem>) {
        self.transactions
            .entry(item.transaction_id().clone())
            .or_insert(item);
    }

    /// Looks up a live transaction. Tombstoned items are reported absent
    /// even before the sweep erases them.
    pub fn get_transaction(&self, transaction_id: &str) -> Option<Arc<TransactionInfoItem>> {
        self.transactions
            .get(transaction_id)
            .map(|entry| entry.value().clone())
            .filter(|item| !item.is_deleted())
    }

    /// Tombstones a transaction for erasure by the next sweep.
    pub fn delete_transaction(&self, transaction_id: &str) {
        if let Some(entry) = self.transactions.get(transaction_id) {
            entry.value().mark_deleted();
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Returns the pooled upstream request for this host, creating and
    /// starting one when absent or terminally failed.
    pub fn upstream_request(&self, host: &Arc<Host>) -> Arc<UpstreamRequest> {
        if let Some(existing) = self.upstream_requests.get(&host.addr()) {
            if existing.state() != ConnState::Failed {
                return existing.clone();
            }
        }
        self.upstream_requests.remove(&host.addr());
        let upstream = UpstreamRequest::new(
            self.cluster_name.clone(),
            host.clone(),
            self.weak_self.clone(),
            self.stats.clone(),
            self.limits,
        );
        upstream.clone().start();
        self.upstream_requests.insert(host.addr(), upstream.clone());
        upstream
    }

    pub fn get_upstream_request(&self, addr: SocketAddr) -> Option<Arc<UpstreamRequest>> {
        self.upstream_requests
            .get(&addr)
            .map(|entry| entry.value().clone())
    }

    /// Unpools a terminally failed upstream request. A live replacement at
    /// the same address is left alone.
    pub(crate) fn remove_failed_upstream(&self, addr: SocketAddr) {
        self.upstream_requests
            .remove_if(&addr, |_, upstream| upstream.state() == ConnState::Failed);
    }

    /// Live transactions pinned to the given upstream host.
    pub(crate) fn pinned_to(&self, addr: SocketAddr) -> Vec<Arc<TransactionInfoItem>> {
        self.transactions
            .iter()
            .filter(|entry| entry.value().upstream().host().addr() == addr)
            .filter(|entry| !entry.value().is_deleted())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// One audit pass: erase tombstoned entries, then reset entries older
    /// than the transaction timeout. Reset entries are tombstoned by the
    /// reset path and erased on the next pass.
    pub fn audit_sweep(&self) {
        let before = self.transactions.len();
        self.transactions.retain(|_, item| !item.is_deleted());
        let erased = before - self.transactions.len();

        let now = Instant::now();
        let mut reset = 0usize;
        for entry in self.transactions.iter() {
            if now.duration_since(entry.value().created_at()) >= self.transaction_timeout {
                entry.value().reset();
                reset += 1;
            }
        }
        if erased > 0 || reset > 0 {
            debug!(
                cluster = %self.cluster_name,
                erased,
                reset,
                remaining = self.transactions.len(),
                "audit sweep"
            );
        }
    }
}

impl Drop for TransactionInfo {
    fn drop(&mut self) {
        if let Some(handle) = self
            .audit_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
