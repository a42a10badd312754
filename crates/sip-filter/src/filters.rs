// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Decoder filter chain.
//!
//! Each decoded message is driven through an ordered chain of filters in
//! four stages. A filter may return [`FilterStatus::StopIteration`] to
//! suspend the walk (the router does this while a routing-assistant lookup
//! is in flight); the suspension point is remembered as a `(stage, index)`
//! tuple and the walk later resumes from the filter after the suspended one,
//! never from the head. A filter that requests a local reply terminates the
//! walk early.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sip_msg::{AppError, MessageMetadata, ResponseKind};
use sip_tra::TraClient;
use smol_str::SmolStr;

use crate::config::{FilterSpec, ROUTER_FILTER_NAME};
use crate::conn_manager::DownstreamHandle;
use crate::route::RouteEntry;
use crate::router::Router;
use crate::ProxyServices;

/// Outcome of one filter stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    /// Suspend the chain walk until the connection re-drives it.
    StopIteration,
}

/// The four decoder stages, in delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TransportBegin,
    MessageBegin,
    MessageEnd,
    TransportEnd,
}

pub(crate) const STAGES: [Stage; 4] = [
    Stage::TransportBegin,
    Stage::MessageBegin,
    Stage::MessageEnd,
    Stage::TransportEnd,
];

/// A locally generated reply requested by a filter, written by the
/// connection manager once the walk terminates.
#[derive(Debug, Clone)]
pub struct LocalReply {
    pub status: u16,
    pub reason: SmolStr,
    pub kind: ResponseKind,
    /// Close the downstream connection after flushing the reply.
    pub close: bool,
}

impl LocalReply {
    pub fn from_error(error: &AppError, close: bool) -> Self {
        Self {
            status: error.status(),
            reason: SmolStr::new(error.reason()),
            kind: error.response_kind(),
            close,
        }
    }
}

/// Per-stage view handed to each filter: the message under inspection plus
/// the services a filter needs to route, reply, or consult the routing
/// assistant.
pub struct FilterContext<'a> {
    pub meta: &'a mut MessageMetadata,
    pub transaction_id: &'a SmolStr,
    pub services: &'a Arc<ProxyServices>,
    pub downstream: &'a DownstreamHandle,
    pub tra: Option<&'a TraClient>,
    pub(crate) cached_route: &'a mut Option<Option<Arc<RouteEntry>>>,
    pub(crate) local_reply: &'a mut Option<LocalReply>,
}

impl FilterContext<'_> {
    /// The route decision for this transaction, computed once and cached for
    /// its lifetime.
    pub fn route(&mut self) -> Option<Arc<RouteEntry>> {
        if self.cached_route.is_none() {
            *self.cached_route = Some(self.services.matcher.route(self.meta));
        }
        self.cached_route.as_ref().and_then(|route| route.clone())
    }

    /// Requests a local reply; the chain walk terminates after the current
    /// filter returns.
    pub fn send_local_reply(&mut self, error: &AppError, close: bool) {
        *self.local_reply = Some(LocalReply::from_error(error, close));
    }
}

/// A decoder filter. Filters run on the connection's task; stage methods
/// may await.
#[async_trait]
pub trait DecoderFilter: Send + Sync {
    async fn transport_begin(&mut self, cx: &mut FilterContext<'_>) -> FilterStatus {
        let _ = cx;
        FilterStatus::Continue
    }

    async fn message_begin(&mut self, cx: &mut FilterContext<'_>) -> FilterStatus {
        let _ = cx;
        FilterStatus::Continue
    }

    async fn message_end(&mut self, cx: &mut FilterContext<'_>) -> FilterStatus {
        let _ = cx;
        FilterStatus::Continue
    }

    async fn transport_end(&mut self, cx: &mut FilterContext<'_>) -> FilterStatus {
        let _ = cx;
        FilterStatus::Continue
    }

    /// Invoked when the owning transaction is reset.
    fn on_reset(&mut self) {}
}

pub(crate) async fn run_stage(
    filter: &mut Box<dyn DecoderFilter>,
    stage: Stage,
    cx: &mut FilterContext<'_>,
) -> FilterStatus {
    match stage {
        Stage::TransportBegin => filter.transport_begin(cx).await,
        Stage::MessageBegin => filter.message_begin(cx).await,
        Stage::MessageEnd => filter.message_end(cx).await,
        Stage::TransportEnd => filter.transport_end(cx).await,
    }
}

/// Result of one full or resumed chain walk.
pub(crate) enum ChainOutcome {
    /// The walk ran to the end, possibly with a local reply to write.
    Complete(Option<LocalReply>),
    /// A filter returned StopIteration; the suspension point is stored on
    /// the transaction.
    Suspended,
}

/// Constructor for a configured decoder filter.
pub type FilterFactory = Arc<dyn Fn(&Arc<ProxyServices>) -> Box<dyn DecoderFilter> + Send + Sync>;

/// Name → factory registry for the configured filter chain.
#[derive(Default)]
pub struct FilterRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl FilterRegistry {
    /// Registry with the built-in router filter.
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(
            ROUTER_FILTER_NAME,
            Arc::new(|_services: &Arc<ProxyServices>| {
                Box::new(Router::new()) as Box<dyn DecoderFilter>
            }),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: FilterFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Builds one chain instance from the configured specs. The router is
    /// appended when the configuration does not name it, so every chain
    /// terminates in a routing decision.
    pub fn build_chain(
        &self,
        services: &Arc<ProxyServices>,
        specs: &[FilterSpec],
    ) -> anyhow::Result<Vec<Box<dyn DecoderFilter>>> {
        let mut chain = Vec::with_capacity(specs.len() + 1);
        let mut has_router = false;
        for spec in specs {
            let factory = self
                .factories
                .get(&spec.name)
                .ok_or_else(|| anyhow::anyhow!("unknown decoder filter: {}", spec.name))?;
            has_router |= spec.name == ROUTER_FILTER_NAME;
            chain.push(factory(services));
        }
        if !has_router {
            chain.push(Box::new(Router::new()) as Box<dyn DecoderFilter>);
        }
        Ok(chain)
    }
}
