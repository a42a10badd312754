// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Traffic Routing Assistant (TRA) client.
//!
//! The TRA is an external oracle mapping opaque affinity keys to upstream
//! host addresses. This crate provides the request/response contract, an
//! async client that delivers responses over a per-connection event channel,
//! and the shared [`AffinityCache`] populated from retrieve hits and
//! subscription pushes.
//!
//! The transport behind the client is abstract; [`StaticTraTransport`] is an
//! in-memory implementation used by tests and standalone deployments.
//!
//! Unreachable or slow TRA backends degrade to an affinity miss: a retrieve
//! that fails or times out still delivers a result event with an empty host,
//! so a suspended message always resumes and falls through to plain load
//! balancing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Key/value pairs carried by TRA responses.
pub type TraPairs = Vec<(SmolStr, SmolStr)>;

/// Requests understood by the routing assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraRequest {
    Create { kind: SmolStr, pairs: TraPairs },
    Update { kind: SmolStr, pairs: TraPairs },
    Retrieve { kind: SmolStr, key: SmolStr },
    Delete { kind: SmolStr, key: SmolStr },
}

/// Responses and pushed updates delivered to the owning connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraEvent {
    CreateAck { kind: SmolStr },
    UpdateAck { kind: SmolStr },
    /// Result of a retrieve; an empty host value is a miss.
    RetrieveResult { kind: SmolStr, pairs: TraPairs },
    DeleteAck { kind: SmolStr },
    /// Pushed key→host pairs from a subscription stream.
    SubscribeUpdate { kind: SmolStr, pairs: TraPairs },
}

/// Transport carrying TRA requests. Implementations must answer requests on
/// the caller's task and keep subscription streams ordered.
#[async_trait]
pub trait TraTransport: Send + Sync + 'static {
    async fn request(&self, request: TraRequest) -> Result<TraEvent>;
    async fn subscribe(&self, kind: &str) -> Result<mpsc::Receiver<TraEvent>>;
}

/// Shared mapping of affinity keys to upstream host addresses, populated by
/// retrieve hits and subscription pushes and read by the router.
#[derive(Debug, Default)]
pub struct AffinityCache {
    map: DashMap<SmolStr, SmolStr>,
}

impl AffinityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<SmolStr> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: impl Into<SmolStr>, host: impl Into<SmolStr>) {
        self.map.insert(key.into(), host.into());
    }

    /// Merges key→host pairs, ignoring pairs with an empty host.
    pub fn merge(&self, pairs: &[(SmolStr, SmolStr)]) {
        for (key, host) in pairs {
            if !host.is_empty() {
                self.map.insert(key.clone(), host.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Per-connection TRA client.
///
/// Requests are issued fire-and-forget; every outcome, including transport
/// failure and timeout, is delivered as a [`TraEvent`] on the channel handed
/// out by [`TraClient::new`]. The owning connection selects on that channel
/// and resumes its suspended message when the retrieve result arrives.
pub struct TraClient {
    transport: Arc<dyn TraTransport>,
    events_tx: mpsc::Sender<TraEvent>,
    timeout: Duration,
    tasks: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
}

impl TraClient {
    pub fn new(
        transport: Arc<dyn TraTransport>,
        timeout: Duration,
    ) -> (Self, mpsc::Receiver<TraEvent>) {
        let (events_tx, events_rx) = mpsc::channel(32);
        (
            Self {
                transport,
                events_tx,
                timeout,
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            },
            events_rx,
        )
    }

    /// Looks up one affinity key. The result event always arrives, carrying
    /// an empty host on failure or timeout so the caller can resume.
    pub fn retrieve(&self, kind: &str, key: &str) {
        let kind = SmolStr::new(kind);
        let key = SmolStr::new(key);
        let request = TraRequest::Retrieve {
            kind: kind.clone(),
            key: key.clone(),
        };
        let fallback = TraEvent::RetrieveResult {
            kind,
            pairs: vec![(key, SmolStr::default())],
        };
        self.issue(request, Some(fallback));
    }

    pub fn create(&self, kind: &str, pairs: TraPairs) {
        self.issue(
            TraRequest::Create {
                kind: SmolStr::new(kind),
                pairs,
            },
            None,
        );
    }

    pub fn update(&self, kind: &str, pairs: TraPairs) {
        self.issue(
            TraRequest::Update {
                kind: SmolStr::new(kind),
                pairs,
            },
            None,
        );
    }

    pub fn delete(&self, kind: &str, key: &str) {
        self.issue(
            TraRequest::Delete {
                kind: SmolStr::new(kind),
                key: SmolStr::new(key),
            },
            None,
        );
    }

    /// Opens a subscription stream for `kind` and forwards its updates, in
    /// order, onto the client's event channel.
    pub fn subscribe(&self, kind: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let kind = kind.to_owned();
        let handle = tokio::spawn(async move {
            let mut stream = match transport.subscribe(&kind).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "tra subscribe failed");
                    return;
                }
            };
            while let Some(event) = stream.recv().await {
                if events.send(event).await.is_err() {
                    break;
                }
            }
            debug!(kind = %kind, "tra subscription stream ended");
        })
        .abort_handle();
        self.track(handle);
    }

    /// Tears the client down. Idempotent; pending request tasks are aborted
    /// and no further events are delivered.
    pub fn close_stream(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    fn issue(&self, request: TraRequest, fallback: Option<TraEvent>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, transport.request(request)).await {
                Ok(Ok(event)) => Some(event),
                Ok(Err(e)) => {
                    warn!(error = %e, "tra request failed");
                    fallback
                }
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "tra request timed out");
                    fallback
                }
            };
            if let Some(event) = event {
                let _ = events.send(event).await;
            }
        })
        .abort_handle();
        self.track(handle);
    }

    fn track(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

/// In-memory TRA backend.
///
/// Answers retrieves from a static key→host table, applies creates, updates,
/// and deletes to it, and pushes the full table as the first subscription
/// update followed by every mutation applied through [`Self::push_update`].
#[derive(Default)]
pub struct StaticTraTransport {
    entries: DashMap<SmolStr, SmolStr>,
    subscribers: Mutex<Vec<mpsc::Sender<TraEvent>>>,
    response_delay: Option<Duration>,
}

impl StaticTraTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response, forcing callers through the suspension path.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.response_delay = Some(delay);
        self
    }

    pub fn insert(&self, key: impl Into<SmolStr>, host: impl Into<SmolStr>) {
        self.entries.insert(key.into(), host.into());
    }

    /// Applies pairs to the table and pushes them to all subscribers.
    pub fn push_update(&self, kind: &str, pairs: TraPairs) {
        for (key, host) in &pairs {
            self.entries.insert(key.clone(), host.clone());
        }
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for tx in subscribers.iter() {
            let event = TraEvent::SubscribeUpdate {
                kind: SmolStr::new(kind),
                pairs: pairs.clone(),
            };
            if tx.try_send(event).is_err() {
                warn!("tra subscriber channel full, dropping update");
            }
        }
    }

    fn snapshot(&self) -> TraPairs {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl TraTransport for StaticTraTransport {
    async fn request(&self, request: TraRequest) -> Result<TraEvent> {
        if let Some(delay) = self.response_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(match request {
            TraRequest::Create { kind, pairs } => {
                for (key, host) in pairs {
                    self.entries.insert(key, host);
                }
                TraEvent::CreateAck { kind }
            }
            TraRequest::Update { kind, pairs } => {
                for (key, host) in pairs {
                    self.entries.insert(key, host);
                }
                TraEvent::UpdateAck { kind }
            }
            TraRequest::Retrieve { kind, key } => {
                let host = self
                    .entries
                    .get(&key)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_default();
                TraEvent::RetrieveResult {
                    kind,
                    pairs: vec![(key, host)],
                }
            }
            TraRequest::Delete { kind, key } => {
                self.entries.remove(&key);
                TraEvent::DeleteAck { kind }
            }
        })
    }

    async fn subscribe(&self, kind: &str) -> Result<mpsc::Receiver<TraEvent>> {
        let (tx, rx) = mpsc::channel(8);
        let snapshot = self.snapshot();
        if !snapshot.is_empty() {
            let _ = tx
                .send(TraEvent::SubscribeUpdate {
                    kind: SmolStr::new(kind),
                    pairs: snapshot,
                })
                .await;
        }
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push(tx);
        Ok(rx)
    }
}
