// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pooled upstream requests and the response path.
//!
//! One [`UpstreamRequest`] owns the TCP connection to a specific cluster
//! host. While the connection is being established, outbound payloads queue
//! in order and flush on connect. Upstream bytes are framed and decoded by a
//! dedicated response path that correlates each response to its downstream
//! transaction by branch, rewrites the endpoint parameter, and writes it to
//! the originating connection. Responses that match no live transaction are
//! dropped and counted; responses whose downstream is already gone are
//! dropped silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sip_msg::{drain_frames, encode, parse_message, AppError, FrameLimits, ParseOptions};
use sip_observe::ProxyStats;
use smol_str::SmolStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::cluster::Host;
use crate::table::TransactionInfo;

/// Timeout for upstream TCP connection establishment.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state of an upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    NotConnected,
    Connecting,
    Connected,
    /// Terminal: the connect failed or the connection was reset.
    Failed,
}

#[derive(Debug)]
struct Inner {
    state: ConnState,
    writer: Option<mpsc::Sender<Bytes>>,
    pending: Vec<Bytes>,
}

/// The pooled request context for one (cluster, host) pair.
#[derive(Debug)]
pub struct UpstreamRequest {
    cluster_name: SmolStr,
    host: Arc<Host>,
    inner: Mutex<Inner>,
    table: Weak<TransactionInfo>,
    stats: Arc<ProxyStats>,
    limits: FrameLimits,
    request_complete: AtomicBool,
    response_complete: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl UpstreamRequest {
    pub(crate) fn new(
        cluster_name: SmolStr,
        host: Arc<Host>,
        table: Weak<TransactionInfo>,
        stats: Arc<ProxyStats>,
        limits: FrameLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster_name,
            host,
            inner: Mutex::new(Inner {
                state: ConnState::NotConnected,
                writer: None,
                pending: Vec::new(),
            }),
            table,
            stats,
            limits,
            request_complete: AtomicBool::new(false),
            response_complete: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn state(&self) -> ConnState {
        self.lock_inner().state
    }

    pub fn request_complete(&self) -> bool {
        self.request_complete.load(Ordering::SeqCst)
    }

    pub fn response_complete(&self) -> bool {
        self.response_complete.load(Ordering::SeqCst)
    }

    /// Begins connecting. Payloads sent while the connect is in flight queue
    /// in order and flush once the connection is ready.
    pub(crate) fn start(self: Arc<Self>) {
        {
            let mut inner = self.lock_inner();
            if inner.state != ConnState::NotConnected {
                return;
            }
            inner.state = ConnState::Connecting;
        }
        let this = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            debug!(cluster = %this.cluster_name, peer = %this.host.addr(), "connecting upstream");
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(this.host.addr())).await
            {
                Ok(Ok(stream)) => Arc::clone(&this).on_pool_ready(stream).await,
                Ok(Err(e)) => this.terminate(&e.to_string()),
                Err(_) => this.terminate(&format!("connect timeout after {:?}", CONNECT_TIMEOUT)),
            }
        })
        .abort_handle();
        self.track(handle);
    }

    /// Writes a payload, or queues it while the connection is pending.
    pub async fn send(&self, payload: Bytes) -> Result<(), AppError> {
        let writer = {
            let mut inner = self.lock_inner();
            match inner.state {
                ConnState::NotConnected | ConnState::Connecting => {
                    inner.pending.push(payload);
                    return Ok(());
                }
                ConnState::Connected => inner.writer.clone(),
                ConnState::Failed => {
                    return Err(AppError::UpstreamConnectFailed(format!(
                        "upstream {} is unavailable",
                        self.host.addr()
                    )))
                }
            }
        };
        match writer {
            Some(writer) => writer
                .send(payload)
                .await
                .map_err(|_| AppError::UpstreamReset)?,
            None => return Err(AppError::UpstreamReset),
        }
        self.request_complete.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_pool_ready(self: Arc<Self>, stream: TcpStream) {
        debug!(cluster = %self.cluster_name, peer = %self.host.addr(), "upstream connected");
        let (mut read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(64);

        let writer_handle = tokio::spawn(async move {
            while let Some(buf) = writer_rx.recv().await {
                if write_half.write_all(&buf).await.is_err() {
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
        });
        self.track(writer_handle.abort_handle());

        let this = Arc::clone(&self);
        let reader_handle = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!(peer = %this.host.addr(), "upstream closed the connection");
                        this.terminate("connection closed by upstream");
                        break;
                    }
                    Ok(_) => match drain_frames(&mut buf, &this.limits) {
                        Ok(frames) => {
                            for frame in frames {
                                this.handle_response(frame).await;
                            }
                        }
                        Err(e) => {
                            warn!(peer = %this.host.addr(), error = %e, "upstream framing error");
                            this.terminate(&e.to_string());
                            break;
                        }
                    },
                    Err(e) => {
                        warn!(peer = %this.host.addr(), error = %e, "upstream read error");
                        this.terminate(&e.to_string());
                        break;
                    }
                }
            }
        });
        self.track(reader_handle.abort_handle());

        let pending = {
            let mut inner = self.lock_inner();
            inner.state = ConnState::Connected;
            inner.writer = Some(writer_tx.clone());
            std::mem::take(&mut inner.pending)
        };
        for payload in pending {
            if writer_tx.send(payload).await.is_err() {
                self.terminate("upstream writer closed during flush");
                return;
            }
            self.request_complete.store(true, Ordering::SeqCst);
        }
    }

    /// Decodes one upstream response and forwards it to the downstream
    /// transaction it correlates with.
    async fn handle_response(&self, frame: Bytes) {
        let mut meta = match parse_message(frame, &ParseOptions::default()) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(peer = %self.host.addr(), error = %e, "undecodable upstream response");
                self.stats.response_decoding_error.inc();
                return;
            }
        };
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let Some(item) = meta
            .transaction_id()
            .and_then(|id| table.get_transaction(id))
        else {
            debug!(peer = %self.host.addr(), "response matches no live transaction, dropping");
            self.stats.response_decoding_error.inc();
            return;
        };

        meta.set_endpoint(item.downstream().local_ip());
        let payload = encode(&meta);
        if !item.downstream().write(payload).await {
            // Downstream is already gone; the response is dropped silently.
            return;
        }
        self.stats.response.inc();

        if meta.status().is_some_and(|code| code >= 200) {
            self.response_complete.store(true, Ordering::SeqCst);
            item.mark_deleted();
        }
    }

    /// Terminal teardown: marks the request failed, unpools it, and fails
    /// every transaction still pinned to this host.
    fn terminate(&self, error: &str) {
        {
            let mut inner = self.lock_inner();
            if inner.state == ConnState::Failed {
                return;
            }
            inner.state = ConnState::Failed;
            inner.writer = None;
            inner.pending.clear();
        }
        warn!(
            cluster = %self.cluster_name,
            peer = %self.host.addr(),
            error,
            "upstream request terminated"
        );
        if let Some(table) = self.table.upgrade() {
            table.remove_failed_upstream(self.host.addr());
            for item in table.pinned_to(self.host.addr()) {
                item.fail(error);
            }
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

impl Drop for UpstreamRequest {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }
}
