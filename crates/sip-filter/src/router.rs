// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The routing filter.
//!
//! One router instance terminates each transaction's decoder chain. The
//! early stages resolve affinity: a destination already on the metadata
//! wins; otherwise the configured affinity keys are checked against the
//! shared cache, and a miss issues a routing-assistant retrieve and
//! suspends the chain. The message-end stage matches the route, checks the
//! cluster, picks a host (pinned to the destination when one is set), and
//! dispatches through the cluster's pooled upstream request, registering the
//! transaction for response correlation.

use std::sync::Arc;

use async_trait::async_trait;
use sip_msg::{encode, AppError, Method, MsgKind};
use smol_str::SmolStr;
use tracing::debug;

use crate::cluster::{Host, LbContext};
use crate::config::AffinitySource;
use crate::filters::{DecoderFilter, FilterContext, FilterStatus};
use crate::table::{TransactionInfo, TransactionInfoItem};
use crate::upstream::UpstreamRequest;

/// Load-balancer context pinning selection to an affinity destination.
struct DestinationLbContext<'a> {
    destination: Option<&'a str>,
    metadata_match: &'a [(SmolStr, SmolStr)],
}

impl LbContext for DestinationLbContext<'_> {
    fn should_select_another_host(&self, host: &Host) -> bool {
        match self.destination {
            Some(destination) => !host.matches_destination(destination),
            None => false,
        }
    }

    fn metadata_match(&self) -> Option<&[(SmolStr, SmolStr)]> {
        Some(self.metadata_match)
    }
}

/// Terminal decoder filter making the per-message routing decision.
#[derive(Default)]
pub struct Router {
    upstream: Option<Arc<UpstreamRequest>>,
    table: Option<Arc<TransactionInfo>>,
    registered_id: Option<SmolStr>,
    pending_tra: bool,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_affinity(&mut self, cx: &mut FilterContext<'_>) -> FilterStatus {
        if cx.meta.destination().is_some() {
            self.pending_tra = false;
            return FilterStatus::Continue;
        }
        // The chain resumed after a retrieve result; whatever destination it
        // produced (possibly none) is already on the metadata.
        if self.pending_tra {
            self.pending_tra = false;
            return FilterStatus::Continue;
        }
        for entry in &cx.services.config.settings.customized_affinity {
            let key = match entry.source {
                AffinitySource::PCookie => cx.meta.p_cookie(),
                AffinitySource::RouteEp => cx.meta.route_ep(),
                AffinitySource::RouteOpaque => cx.meta.route_opaque(),
            };
            let Some(key) = key else { continue };
            if key.is_empty() {
                continue;
            }
            if let Some(host) = cx.services.affinity.get(key) {
                debug!(key, host = %host, "affinity cache hit");
                cx.meta.set_destination(host);
                return FilterStatus::Continue;
            }
            if let Some(tra) = cx.tra {
                debug!(key, kind = %entry.key_name, "affinity miss, querying routing assistant");
                tra.retrieve(&entry.key_name, key);
                self.pending_tra = true;
                return FilterStatus::StopIteration;
            }
        }
        FilterStatus::Continue
    }

    async fn dispatch(&mut self, cx: &mut FilterContext<'_>) -> FilterStatus {
        if cx.meta.kind() == MsgKind::Response {
            return FilterStatus::Continue;
        }

        // A transaction that already selected its upstream (an ACK reusing
        // the INVITE transaction, or a retransmission) follows it without a
        // fresh balancer pick.
        if let Some(upstream) = self.upstream.clone() {
            cx.meta.set_endpoint(cx.downstream.local_ip());
            let payload = encode(cx.meta);
            if let Err(e) = upstream.send(payload).await {
                cx.send_local_reply(&e, false);
            }
            return FilterStatus::Continue;
        }

        let stats = cx.services.stats.clone();
        let Some(route) = cx.route() else {
            stats.route_missing.inc();
            cx.send_local_reply(&AppError::RouteMissing, false);
            return FilterStatus::Continue;
        };
        let cluster_name = route.cluster_name().to_owned();

        let Some(cluster) = cx.services.clusters.get(&cluster_name) else {
            stats.unknown_cluster.inc();
            cx.send_local_reply(&AppError::UnknownCluster(cluster_name), false);
            return FilterStatus::Continue;
        };
        if cluster.in_maintenance() {
            stats.upstream_rq_maintenance_mode.inc();
            cx.send_local_reply(&AppError::MaintenanceMode(cluster_name), false);
            return FilterStatus::Continue;
        }

        let destination = cx.meta.destination().map(SmolStr::new);
        let lb = DestinationLbContext {
            destination: destination.as_deref(),
            metadata_match: route.metadata_match(),
        };
        let Some(host) = cluster.pick(&lb) else {
            stats.no_healthy_upstream.inc();
            cx.send_local_reply(&AppError::NoHealthyUpstream(cluster_name), false);
            return FilterStatus::Continue;
        };
        debug!(
            transaction = %cx.transaction_id,
            cluster = %cluster_name,
            host = %host.addr(),
            destination = destination.as_deref().unwrap_or(""),
            "routing to upstream host"
        );

        let table = cx.services.table_for(&cluster_name);
        let upstream = table.upstream_request(&host);

        cx.meta.set_endpoint(cx.downstream.local_ip());
        let payload = encode(cx.meta);

        // An ACK expects no response, so it is never registered for
        // response correlation. Everything else registers before the write
        // so a fast response finds the item.
        if !cx.meta.method().is_some_and(Method::is_ack) {
            let item = TransactionInfoItem::new(
                cx.transaction_id.clone(),
                cx.downstream.clone(),
                upstream.clone(),
            );
            table.insert_transaction(item);
            self.registered_id = Some(cx.transaction_id.clone());
        }
        self.table = Some(table);
        self.upstream = Some(upstream.clone());

        if let Err(e) = upstream.send(payload).await {
            cx.send_local_reply(&e, false);
        }
        FilterStatus::Continue
    }
}

#[async_trait]
impl DecoderFilter for Router {
    async fn transport_begin(&mut self, cx: &mut FilterContext<'_>) -> FilterStatus {
        self.handle_affinity(cx)
    }

    async fn message_begin(&mut self, cx: &mut FilterContext<'_>) -> FilterStatus {
        self.handle_affinity(cx)
    }

    async fn message_end(&mut self, cx: &mut FilterContext<'_>) -> FilterStatus {
        self.dispatch(cx).await
    }

    fn on_reset(&mut self) {
        if let (Some(table), Some(id)) = (&self.table, &self.registered_id) {
            table.delete_transaction(id);
        }
    }
}
