// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-connection management: decoding, transactions, and the filter chain.
//!
//! One [`ConnectionManager`] owns each downstream TCP connection. Its task
//! appends ingress bytes to the request buffer, drains complete messages,
//! materialises or reuses an [`ActiveTransaction`] per branch, and drives
//! the transaction's filter chain. The chain may suspend mid-walk awaiting a
//! routing-assistant reply; the manager re-drives it when the reply event
//! arrives and only then moves on to queued messages, preserving request
//! order toward the upstream.
//!
//! Responses forwarded by upstream reader tasks do not pass through this
//! task; they reach the downstream socket through the writer handle
//! registered in the transaction table. Resets and upstream failures do pass
//! through, as events, so all transaction state stays owned here.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use sip_msg::{
    drain_frames, encode, parse_message, AppError, MessageMetadata, Method, MsgKind, ParseOptions,
    ResponseKind,
};
use sip_tra::{TraClient, TraEvent};
use smol_str::SmolStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::filters::{
    run_stage, ChainOutcome, DecoderFilter, FilterContext, FilterStatus, LocalReply, Stage, STAGES,
};
use crate::route::RouteEntry;
use crate::ProxyServices;

/// Events posted back to a connection's task by tables, upstream requests,
/// and the audit sweep.
#[derive(Debug, Clone)]
pub enum TransEvent {
    /// Reset one transaction (audit timeout or upstream-initiated).
    Reset { transaction_id: SmolStr },
    /// The upstream pinned to one transaction failed terminally.
    UpstreamFailed {
        transaction_id: SmolStr,
        error: String,
    },
}

/// Cloneable handle to a downstream connection: the write path for encoded
/// messages and the event path back into the connection's task.
#[derive(Debug, Clone)]
pub struct DownstreamHandle {
    writer: mpsc::Sender<Bytes>,
    events: mpsc::UnboundedSender<TransEvent>,
    local_ip: SmolStr,
}

impl DownstreamHandle {
    pub(crate) fn new(
        writer: mpsc::Sender<Bytes>,
        events: mpsc::UnboundedSender<TransEvent>,
        local_ip: SmolStr,
    ) -> Self {
        Self {
            writer,
            events,
            local_ip,
        }
    }

    /// IP the downstream connection is bound to locally; the value written
    /// into the `ep` parameter of every outbound message.
    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    /// Writes already-encoded bytes to the downstream connection. Returns
    /// false when the connection is gone.
    pub async fn write(&self, payload: Bytes) -> bool {
        self.writer.send(payload).await.is_ok()
    }

    pub fn notify_reset(&self, transaction_id: &SmolStr) {
        let _ = self.events.send(TransEvent::Reset {
            transaction_id: transaction_id.clone(),
        });
    }

    pub fn notify_upstream_failed(&self, transaction_id: &SmolStr, error: &str) {
        let _ = self.events.send(TransEvent::UpstreamFailed {
            transaction_id: transaction_id.clone(),
            error: error.to_owned(),
        });
    }
}

/// One transaction on one downstream connection: the current message, the
/// filter chain with its suspension point, and the cached route decision.
pub(crate) struct ActiveTransaction {
    transaction_id: SmolStr,
    meta: MessageMetadata,
    filters: Vec<Box<dyn DecoderFilter>>,
    resume: Option<(Stage, usize)>,
    cached_route: Option<Option<Arc<RouteEntry>>>,
    local_response_sent: bool,
}

impl ActiveTransaction {
    fn new(transaction_id: SmolStr, meta: MessageMetadata, filters: Vec<Box<dyn DecoderFilter>>) -> Self {
        Self {
            transaction_id,
            meta,
            filters,
            resume: None,
            cached_route: None,
            local_response_sent: false,
        }
    }

    /// Adopts the next message of a reused transaction. The cached route
    /// decision survives; the chain restarts from the head.
    fn begin(&mut self, meta: MessageMetadata) {
        self.meta = meta;
        self.resume = None;
        self.local_response_sent = false;
    }

    /// Walks the filter chain from the head, or from just after the filter
    /// that suspended it. A requested local reply terminates the walk early
    /// and as-if successful.
    async fn run(
        &mut self,
        services: &Arc<ProxyServices>,
        downstream: &DownstreamHandle,
        tra: Option<&TraClient>,
    ) -> ChainOutcome {
        let ActiveTransaction {
            transaction_id,
            meta,
            filters,
            resume,
            cached_route,
            local_response_sent,
        } = self;

        if *local_response_sent {
            // A prior local reply consumed the rest of this message.
            return ChainOutcome::Complete(None);
        }

        let (start_stage, start_index) = match resume.take() {
            Some((stage, index)) => (stage, index + 1),
            None => (Stage::TransportBegin, 0),
        };
        let mut local_reply: Option<LocalReply> = None;
        let mut reached = false;
        for stage in STAGES {
            if !reached {
                if stage != start_stage {
                    continue;
                }
                reached = true;
            }
            let from = if stage == start_stage { start_index } else { 0 };
            for index in from..filters.len() {
                let mut cx = FilterContext {
                    meta: &mut *meta,
                    transaction_id: &*transaction_id,
                    services,
                    downstream,
                    tra,
                    cached_route: &mut *cached_route,
                    local_reply: &mut local_reply,
                };
                let status = run_stage(&mut filters[index], stage, &mut cx).await;
                if local_reply.is_some() {
                    *local_response_sent = true;
                    return ChainOutcome::Complete(local_reply);
                }
                if status == FilterStatus::StopIteration {
                    *resume = Some((stage, index));
                    return ChainOutcome::Suspended;
                }
            }
        }
        ChainOutcome::Complete(None)
    }

    fn on_reset(&mut self) {
        for filter in &mut self.filters {
            filter.on_reset();
        }
    }
}

enum CloseMode {
    /// Flush pending writes, then close.
    Flush,
    /// Tear down without flushing.
    NoFlush,
}

enum Wake {
    Read(std::io::Result<usize>),
    Event(Option<TransEvent>),
    Tra(Option<TraEvent>),
}

/// Owner of one downstream TCP connection.
pub struct ConnectionManager {
    services: Arc<ProxyServices>,
    peer: SocketAddr,
    local_ip: SmolStr,
    handle: DownstreamHandle,
    events_rx: mpsc::UnboundedReceiver<TransEvent>,
    tra: Option<TraClient>,
    tra_events: Option<mpsc::Receiver<TraEvent>>,
    buffer: BytesMut,
    pending_frames: VecDeque<Bytes>,
    transactions: HashMap<SmolStr, ActiveTransaction>,
    suspended: Option<SmolStr>,
    closing: Option<CloseMode>,
}

impl ConnectionManager {
    /// Runs the connection to completion. One call per accepted downstream
    /// socket; the future lives as long as the connection.
    pub async fn run(
        services: Arc<ProxyServices>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let local_ip = SmolStr::new(stream.local_addr()?.ip().to_string());
        let (mut read_half, mut write_half) = stream.into_split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(32);
        let writer_task = tokio::spawn(async move {
            while let Some(buf) = writer_rx.recv().await {
                // An empty payload is the close marker: pending writes are
                // flushed before the socket shuts down.
                if buf.is_empty() {
                    break;
                }
                if write_half.write_all(&buf).await.is_err() {
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = DownstreamHandle::new(writer_tx.clone(), events_tx, local_ip.clone());

        let (tra, tra_events) = match (&services.tra_transport, &services.config.settings.tra) {
            (Some(transport), Some(tra_config)) => {
                let (client, events) = TraClient::new(transport.clone(), tra_config.request_timeout);
                (Some(client), Some(events))
            }
            _ => (None, None),
        };

        let mut manager = Self {
            services,
            peer,
            local_ip,
            handle,
            events_rx,
            tra,
            tra_events,
            buffer: BytesMut::with_capacity(4096),
            pending_frames: VecDeque::new(),
            transactions: HashMap::new(),
            suspended: None,
            closing: None,
        };

        // Warm the shared affinity map from pushed updates.
        if let Some(client) = &manager.tra {
            for entry in &manager.services.config.settings.customized_affinity {
                client.subscribe(&entry.key_name);
            }
        }

        info!(peer = %peer, "downstream connection accepted");
        manager.event_loop(&mut read_half).await;

        if let Some(client) = &manager.tra {
            client.close_stream();
        }
        match manager.closing {
            Some(CloseMode::NoFlush) => writer_task.abort(),
            _ => {
                let _ = writer_tx.send(Bytes::new()).await;
                let _ = writer_task.await;
            }
        }
        info!(peer = %peer, "downstream connection closed");
        Ok(())
    }

    async fn event_loop(&mut self, read_half: &mut OwnedReadHalf) {
        loop {
            if self.closing.is_some() {
                break;
            }
            let wake = tokio::select! {
                read = read_half.read_buf(&mut self.buffer) => Wake::Read(read),
                event = self.events_rx.recv() => Wake::Event(event),
                event = recv_tra(&mut self.tra_events) => Wake::Tra(event),
            };
            match wake {
                Wake::Read(Ok(0)) => {
                    debug!(peer = %self.peer, "downstream half-closed");
                    self.reset_all_transactions(false);
                    self.closing = Some(CloseMode::Flush);
                }
                Wake::Read(Ok(_)) => self.dispatch().await,
                Wake::Read(Err(e)) => {
                    warn!(peer = %self.peer, error = %e, "downstream read error");
                    self.reset_all_transactions(false);
                    self.closing = Some(CloseMode::NoFlush);
                }
                Wake::Event(Some(event)) => self.handle_trans_event(event).await,
                Wake::Event(None) => break,
                Wake::Tra(Some(event)) => self.on_tra_event(event).await,
                Wake::Tra(None) => self.tra_events = None,
            }
        }
    }

    /// Drains complete messages from the request buffer and processes them
    /// until one suspends or the buffer runs dry.
    async fn dispatch(&mut self) {
        match drain_frames(&mut self.buffer, &self.services.limits) {
            Ok(frames) => self.pending_frames.extend(frames),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "framing error, closing connection");
                self.reset_all_transactions(true);
                self.closing = Some(CloseMode::NoFlush);
                return;
            }
        }
        self.process_pending().await;
    }

    async fn process_pending(&mut self) {
        while self.suspended.is_none() && self.closing.is_none() {
            let Some(frame) = self.pending_frames.pop_front() else {
                break;
            };
            self.handle_frame(frame).await;
        }
    }

    async fn handle_frame(&mut self, frame: Bytes) {
        let meta = match parse_message(frame, &self.services.parse_options) {
            Ok(meta) => meta,
            Err(e) => {
                // No usable metadata: nothing to answer on, close without
                // flushing.
                warn!(peer = %self.peer, error = %e, "undecodable message, closing connection");
                self.reset_all_transactions(true);
                self.closing = Some(CloseMode::NoFlush);
                return;
            }
        };
        let Some(id) = meta.transaction_id().map(SmolStr::new) else {
            warn!(peer = %self.peer, "message without transaction id, closing connection");
            self.reset_all_transactions(true);
            self.closing = Some(CloseMode::NoFlush);
            return;
        };
        trace!(
            peer = %self.peer,
            transaction = %id,
            method = meta.method().map(|m| m.as_str()).unwrap_or("-"),
            "decoded message"
        );

        if self.transactions.contains_key(&id) {
            // Only an ACK joins the transaction its branch indexes (the ACK
            // answering a non-2xx final response). Any other message re-sent
            // with a known branch is a retransmission and is absorbed by the
            // transaction that owns the branch.
            if !meta.method().is_some_and(Method::is_ack) {
                debug!(peer = %self.peer, transaction = %id, "retransmission absorbed");
                return;
            }
            debug!(peer = %self.peer, transaction = %id, "ack joins existing transaction");
            if let Some(trans) = self.transactions.get_mut(&id) {
                trans.begin(meta);
            }
        } else {
            let filters = match self
                .services
                .registry
                .build_chain(&self.services, &self.services.config.filters)
            {
                Ok(filters) => filters,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "cannot build filter chain");
                    self.reset_all_transactions(true);
                    self.closing = Some(CloseMode::NoFlush);
                    return;
                }
            };
            self.transactions
                .insert(id.clone(), ActiveTransaction::new(id.clone(), meta, filters));
        }
        self.run_transaction(id).await;
    }

    async fn run_transaction(&mut self, id: SmolStr) {
        let Some(mut trans) = self.transactions.remove(&id) else {
            return;
        };
        let outcome = trans
            .run(&self.services, &self.handle, self.tra.as_ref())
            .await;
        match outcome {
            ChainOutcome::Suspended => {
                debug!(peer = %self.peer, transaction = %id, "filter chain suspended");
                self.suspended = Some(id.clone());
                self.transactions.insert(id, trans);
            }
            ChainOutcome::Complete(local_reply) => {
                if trans.meta.kind() == MsgKind::Request {
                    self.services.stats.request.inc();
                }
                if let Some(reply) = local_reply {
                    self.send_local_reply(&trans.meta, &reply).await;
                    if reply.close {
                        trans.on_reset();
                        self.reset_all_transactions(true);
                        self.closing = Some(CloseMode::Flush);
                        return;
                    }
                }
                self.transactions.insert(id, trans);
            }
        }
    }

    /// Encodes and writes a locally generated reply, echoing the request's
    /// dialog headers with the endpoint parameter set to the local IP.
    async fn send_local_reply(&self, meta: &MessageMetadata, reply: &LocalReply) {
        let mut head = format!("SIP/2.0 {} {}\r\n", reply.status, reply.reason);
        if let Some(via) = meta.top_via() {
            head.push_str("Via: ");
            head.push_str(via);
            head.push_str("\r\n");
        }
        if let Some(from) = meta.from_header() {
            head.push_str("From: ");
            head.push_str(from);
            head.push_str("\r\n");
        }
        if let Some(to) = meta.to_header() {
            head.push_str("To: ");
            head.push_str(to);
            head.push_str("\r\n");
        }
        if let Some(call_id) = meta.call_id() {
            head.push_str("Call-ID: ");
            head.push_str(call_id);
            head.push_str("\r\n");
        }
        if let Some(cseq) = meta.cseq() {
            head.push_str("CSeq: ");
            head.push_str(cseq);
            head.push_str("\r\n");
        }
        head.push_str("Content-Length: 0\r\n\r\n");

        let raw = Bytes::from(head.into_bytes());
        let payload = match parse_message(raw.clone(), &ParseOptions::default()) {
            Ok(mut reply_meta) => {
                reply_meta.set_endpoint(&self.local_ip);
                encode(&reply_meta)
            }
            // Without an echoable Via the reply carries no endpoint.
            Err(_) => raw,
        };
        debug!(peer = %self.peer, status = reply.status, "sending local reply");
        let _ = self.handle.write(payload).await;

        match reply.kind {
            ResponseKind::Success => self.services.stats.response_success.inc(),
            ResponseKind::Error => self.services.stats.response_error.inc(),
            ResponseKind::Exception => self.services.stats.response_exception.inc(),
        }
    }

    async fn handle_trans_event(&mut self, event: TransEvent) {
        match event {
            TransEvent::Reset { transaction_id } => {
                if let Some(mut trans) = self.transactions.remove(&transaction_id) {
                    debug!(peer = %self.peer, transaction = %transaction_id, "transaction reset");
                    trans.on_reset();
                    if self.suspended.as_ref() == Some(&transaction_id) {
                        self.suspended = None;
                        self.process_pending().await;
                    }
                }
            }
            TransEvent::UpstreamFailed {
                transaction_id,
                error,
            } => {
                if let Some(mut trans) = self.transactions.remove(&transaction_id) {
                    warn!(
                        peer = %self.peer,
                        transaction = %transaction_id,
                        error = %error,
                        "upstream failed, answering locally"
                    );
                    let reply =
                        LocalReply::from_error(&AppError::UpstreamConnectFailed(error), false);
                    self.send_local_reply(&trans.meta, &reply).await;
                    trans.on_reset();
                    if self.suspended.as_ref() == Some(&transaction_id) {
                        self.suspended = None;
                        self.process_pending().await;
                    }
                }
            }
        }
    }

    async fn on_tra_event(&mut self, event: TraEvent) {
        match event {
            TraEvent::RetrieveResult { pairs, .. } => {
                self.services.affinity.merge(&pairs);
                if let Some(id) = &self.suspended {
                    if let Some(trans) = self.transactions.get_mut(id) {
                        if let Some((key, host)) =
                            pairs.iter().find(|(_, host)| !host.is_empty())
                        {
                            debug!(
                                peer = %self.peer,
                                transaction = %id,
                                key = %key,
                                host = %host,
                                "routing assistant resolved affinity"
                            );
                            trans.meta.set_destination(host.clone());
                        }
                    }
                }
                self.continue_handling().await;
            }
            TraEvent::SubscribeUpdate { pairs, .. } => {
                debug!(peer = %self.peer, count = pairs.len(), "routing assistant pushed updates");
                self.services.affinity.merge(&pairs);
            }
            TraEvent::CreateAck { .. } | TraEvent::UpdateAck { .. } | TraEvent::DeleteAck { .. } => {
                trace!(peer = %self.peer, "routing assistant acknowledged");
            }
        }
    }

    /// Resumes the suspended transaction, then keeps processing queued
    /// messages.
    async fn continue_handling(&mut self) {
        let Some(id) = self.suspended.take() else {
            return;
        };
        self.run_transaction(id).await;
        self.process_pending().await;
    }

    /// Resets every active transaction once. Callbacks may re-enter the
    /// per-cluster tables, so the ids are snapshotted before iterating.
    fn reset_all_transactions(&mut self, local_reset: bool) {
        let ids: Vec<SmolStr> = self.transactions.keys().cloned().collect();
        if !ids.is_empty() {
            info!(
                peer = %self.peer,
                count = ids.len(),
                local = local_reset,
                "resetting active transactions"
            );
        }
        for id in ids {
            if local_reset {
                self.services.stats.cx_destroy_local_with_active_rq.inc();
            } else {
                self.services.stats.cx_destroy_remote_with_active_rq.inc();
            }
            if let Some(mut trans) = self.transactions.remove(&id) {
                trans.on_reset();
            }
        }
        self.suspended = None;
    }
}

async fn recv_tra(rx: &mut Option<mpsc::Receiver<TraEvent>>) -> Option<TraEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
