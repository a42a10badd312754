// sift-rs - The Sift SIP Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end proxy flows over real sockets: a downstream client, the proxy,
//! and mock upstream hosts that answer with canned responses.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sip_filter::{
    bind_listener, serve, AffinityEntry, AffinitySource, Cluster, ClusterManager, ProxyConfig,
    ProxyServices, Route, TraServiceConfig,
};
use sip_msg::{drain_frames, FrameLimits};
use sip_testkit::{build_ack, build_invite, build_invite_with_route, response_for};
use sip_tra::{StaticTraTransport, TraTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct UpstreamMsg {
    conn_id: usize,
    raw: Bytes,
    reply: mpsc::UnboundedSender<Bytes>,
}

impl UpstreamMsg {
    fn text(&self) -> &str {
        std::str::from_utf8(&self.raw).unwrap()
    }
}

/// Starts a mock upstream host: every received SIP frame is delivered to the
/// returned channel along with a handle for sending bytes back on the same
/// connection.
async fn spawn_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<UpstreamMsg>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut next_conn_id = 0usize;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            next_conn_id += 1;
            let conn_id = next_conn_id;
            let tx = tx.clone();
            tokio::spawn(async move {
                let (mut read_half, mut write_half) = stream.into_split();
                let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();
                tokio::spawn(async move {
                    while let Some(payload) = reply_rx.recv().await {
                        if write_half.write_all(&payload).await.is_err() {
                            break;
                        }
                    }
                });
                let mut buf = BytesMut::new();
                loop {
                    match read_half.read_buf(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let frames = drain_frames(&mut buf, &FrameLimits::default()).unwrap();
                            for raw in frames {
                                let msg = UpstreamMsg {
                                    conn_id,
                                    raw,
                                    reply: reply_tx.clone(),
                                };
                                if tx.send(msg).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, rx)
}

struct Client {
    stream: TcpStream,
    buf: BytesMut,
    frames: VecDeque<Bytes>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::new(),
            frames: VecDeque::new(),
        }
    }

    async fn send(&mut self, payload: &Bytes) {
        self.stream.write_all(payload).await.unwrap();
    }

    async fn recv_frame(&mut self) -> String {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return String::from_utf8(frame.to_vec()).unwrap();
            }
            self.frames
                .extend(drain_frames(&mut self.buf, &FrameLimits::default()).unwrap());
            if !self.frames.is_empty() {
                continue;
            }
            let n = timeout(WAIT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(n > 0, "connection closed while waiting for a frame");
        }
    }
}

fn proxy_config(routes: Vec<Route>) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.route_config.routes = routes;
    config
}

async fn start_proxy(
    config: ProxyConfig,
    clusters: ClusterManager,
    tra: Option<Arc<StaticTraTransport>>,
) -> (SocketAddr, Arc<ProxyServices>) {
    let tra_transport = tra.map(|transport| transport as Arc<dyn TraTransport>);
    let services = Arc::new(ProxyServices::new(config, Arc::new(clusters), tra_transport));
    let listener = bind_listener("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_services = services.clone();
    tokio::spawn(async move {
        let _ = serve(serve_services, listener).await;
    });
    (addr, services)
}

#[tokio::test]
async fn invite_round_trips_through_the_balancer_pick() {
    let (upstream_addr, mut upstream_rx) = spawn_upstream().await;
    let clusters = ClusterManager::new();
    clusters.insert(Cluster::new("c1", vec![upstream_addr]));
    let (proxy_addr, services) =
        start_proxy(proxy_config(vec![Route::new("ex.com", "c1")]), clusters, None).await;

    let mut client = Client::connect(proxy_addr).await;
    client
        .send(&build_invite("sip:alice@ex.com", "z9hG4bK-1", "cid-1"))
        .await;

    let msg = timeout(WAIT, upstream_rx.recv()).await.unwrap().unwrap();
    let text = msg.text().to_owned();
    assert!(text.starts_with("INVITE sip:alice@ex.com SIP/2.0\r\n"));
    assert!(
        text.contains(";ep=127.0.0.1"),
        "egress is missing the endpoint rewrite: {text}"
    );

    msg.reply.send(response_for(&msg.raw, 200, "OK")).unwrap();
    let response = client.recv_frame().await;
    assert!(response.starts_with("SIP/2.0 200 OK\r\n"), "{response}");
    assert!(response.contains("branch=z9hG4bK-1"));
    assert!(response.contains(";ep=127.0.0.1"));

    let snap = services.stats.snapshot();
    assert_eq!(snap.request, 1);
    assert_eq!(snap.response, 1);
    assert_eq!(snap.response_decoding_error, 0);
}

#[tokio::test]
async fn ack_for_4xx_reuses_the_transaction_and_connection() {
    let (upstream_addr, mut upstream_rx) = spawn_upstream().await;
    let clusters = ClusterManager::new();
    clusters.insert(Cluster::new("c1", vec![upstream_addr]));
    let (proxy_addr, _services) =
        start_proxy(proxy_config(vec![Route::new("ex.com", "c1")]), clusters, None).await;

    let mut client = Client::connect(proxy_addr).await;
    client
        .send(&build_invite("sip:alice@ex.com", "z9hG4bK-2", "cid-2"))
        .await;

    let invite = timeout(WAIT, upstream_rx.recv()).await.unwrap().unwrap();
    assert!(invite.text().starts_with("INVITE "));
    invite
        .reply
        .send(response_for(&invite.raw, 486, "Busy Here"))
        .unwrap();
    let response = client.recv_frame().await;
    assert!(response.starts_with("SIP/2.0 486 Busy Here\r\n"), "{response}");

    client
        .send(&build_ack("sip:alice@ex.com", "z9hG4bK-2", "cid-2"))
        .await;
    let ack = timeout(WAIT, upstream_rx.recv()).await.unwrap().unwrap();
    assert!(ack.text().starts_with("ACK "));
    assert!(ack.text().contains("branch=z9hG4bK-2"));
    assert_eq!(
        ack.conn_id, invite.conn_id,
        "ack must ride the connection its INVITE used"
    );
}

#[tokio::test]
async fn retransmitted_invite_is_absorbed() {
    let (upstream_addr, mut upstream_rx) = spawn_upstream().await;
    let clusters = ClusterManager::new();
    clusters.insert(Cluster::new("c1", vec![upstream_addr]));
    let (proxy_addr, _services) =
        start_proxy(proxy_config(vec![Route::new("ex.com", "c1")]), clusters, None).await;

    let mut client = Client::connect(proxy_addr).await;
    let invite = build_invite("sip:alice@ex.com", "z9hG4bK-rt", "cid-rt");
    client.send(&invite).await;
    client.send(&invite).await;

    let first = timeout(WAIT, upstream_rx.recv()).await.unwrap().unwrap();
    assert!(first.text().starts_with("INVITE "));
    assert!(
        timeout(Duration::from_millis(200), upstream_rx.recv())
            .await
            .is_err(),
        "the duplicate must be absorbed by the transaction owning the branch"
    );

    first.reply.send(response_for(&first.raw, 200, "OK")).unwrap();
    let response = client.recv_frame().await;
    assert!(response.starts_with("SIP/2.0 200 OK\r\n"));
}

#[tokio::test]
async fn tra_affinity_overrides_the_balancer() {
    let (host_a, mut a_rx) = spawn_upstream().await;
    let (host_b, mut b_rx) = spawn_upstream().await;
    let clusters = ClusterManager::new();
    clusters.insert(Cluster::new("c1", vec![host_a, host_b]));

    let mut config = proxy_config(vec![Route::new("proxy.pcsf.com", "c1")]);
    config.settings.customized_affinity =
        vec![AffinityEntry::new(AffinitySource::RouteEp, "lskpmc")];
    config.settings.tra = Some(TraServiceConfig::default());
    let transport = Arc::new(StaticTraTransport::new());
    let (proxy_addr, _services) = start_proxy(config, clusters, Some(transport.clone())).await;

    let mut client = Client::connect(proxy_addr).await;
    transport.insert("abc", host_b.to_string());
    client
        .send(&build_invite_with_route(
            "sip:alice@ex.com",
            "z9hG4bK-3",
            "cid-3",
            "<sip:proxy.pcsf.com;ep=abc>",
        ))
        .await;

    let msg = timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
    assert!(msg.text().starts_with("INVITE "));
    assert!(msg.text().contains("branch=z9hG4bK-3"));
    assert!(
        msg.text().contains("ep=127.0.0.1"),
        "route ep must be rewritten to the proxy: {}",
        msg.text()
    );
    assert!(
        timeout(Duration::from_millis(200), a_rx.recv()).await.is_err(),
        "the balancer's default pick must not see the pinned message"
    );

    msg.reply.send(response_for(&msg.raw, 200, "OK")).unwrap();
    let response = client.recv_frame().await;
    assert!(response.starts_with("SIP/2.0 200 OK\r\n"));
}

#[tokio::test]
async fn empty_cluster_answers_503_locally() {
    let clusters = ClusterManager::new();
    clusters.insert(Cluster::new("c1", Vec::new()));
    let (proxy_addr, services) =
        start_proxy(proxy_config(vec![Route::new("ex.com", "c1")]), clusters, None).await;

    let mut client = Client::connect(proxy_addr).await;
    client
        .send(&build_invite("sip:alice@ex.com", "z9hG4bK-4", "cid-4"))
        .await;

    let response = client.recv_frame().await;
    assert!(
        response.starts_with("SIP/2.0 503 Service Unavailable\r\n"),
        "{response}"
    );
    assert!(response.contains("branch=z9hG4bK-4"));
    assert!(response.contains(";ep=127.0.0.1"));

    let snap = services.stats.snapshot();
    assert_eq!(snap.no_healthy_upstream, 1);
    assert_eq!(snap.response_error, 1);
    assert_eq!(snap.request, 1);
}

#[tokio::test]
async fn unknown_cluster_and_missing_route_are_counted() {
    let clusters = ClusterManager::new();
    let (proxy_addr, services) =
        start_proxy(proxy_config(vec![Route::new("ex.com", "ghost")]), clusters, None).await;

    let mut client = Client::connect(proxy_addr).await;
    client
        .send(&build_invite("sip:alice@ex.com", "z9hG4bK-5", "cid-5"))
        .await;
    let response = client.recv_frame().await;
    assert!(response.starts_with("SIP/2.0 503 Service Unavailable\r\n"));
    assert_eq!(services.stats.snapshot().unknown_cluster, 1);

    client
        .send(&build_invite("sip:alice@nowhere.net", "z9hG4bK-6", "cid-6"))
        .await;
    let response = client.recv_frame().await;
    assert!(response.starts_with("SIP/2.0 404 Not Found\r\n"));
    assert_eq!(services.stats.snapshot().route_missing, 1);
}

#[tokio::test]
async fn maintenance_mode_rejects_without_dialing() {
    let (upstream_addr, mut upstream_rx) = spawn_upstream().await;
    let cluster = Cluster::new("c1", vec![upstream_addr]);
    cluster.set_maintenance(true);
    let clusters = ClusterManager::new();
    clusters.insert(cluster);
    let (proxy_addr, services) =
        start_proxy(proxy_config(vec![Route::new("ex.com", "c1")]), clusters, None).await;

    let mut client = Client::connect(proxy_addr).await;
    client
        .send(&build_invite("sip:alice@ex.com", "z9hG4bK-7", "cid-7"))
        .await;
    let response = client.recv_frame().await;
    assert!(response.starts_with("SIP/2.0 503 Service Unavailable\r\n"));
    assert_eq!(services.stats.snapshot().upstream_rq_maintenance_mode, 1);
    assert!(
        timeout(Duration::from_millis(200), upstream_rx.recv())
            .await
            .is_err(),
        "a drained cluster must not be dialed"
    );
}

#[tokio::test]
async fn half_close_with_inflight_request_resets_exactly_once() {
    let (upstream_addr, mut upstream_rx) = spawn_upstream().await;
    let clusters = ClusterManager::new();
    clusters.insert(Cluster::new("c1", vec![upstream_addr]));
    let (proxy_addr, services) =
        start_proxy(proxy_config(vec![Route::new("ex.com", "c1")]), clusters, None).await;

    let mut client = Client::connect(proxy_addr).await;
    client
        .send(&build_invite("sip:alice@ex.com", "z9hG4bK-8", "cid-8"))
        .await;
    let _held = timeout(WAIT, upstream_rx.recv()).await.unwrap().unwrap();

    client.stream.shutdown().await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if services.stats.snapshot().cx_destroy_remote_with_active_rq == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "remote close with an active request was never counted"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The transaction resets exactly once.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(services.stats.snapshot().cx_destroy_remote_with_active_rq, 1);
}

#[tokio::test]
async fn audit_sweep_resets_and_erases_timed_out_transactions() {
    let (upstream_addr, mut upstream_rx) = spawn_upstream().await;
    let clusters = ClusterManager::new();
    clusters.insert(Cluster::new("c1", vec![upstream_addr]));
    let mut config = proxy_config(vec![Route::new("ex.com", "c1")]);
    config.settings.transaction_timeout = Duration::from_millis(500);
    let (proxy_addr, services) = start_proxy(config, clusters, None).await;

    let mut client = Client::connect(proxy_addr).await;
    client
        .send(&build_invite("sip:alice@ex.com", "z9hG4bK-9", "cid-9"))
        .await;
    let _held = timeout(WAIT, upstream_rx.recv()).await.unwrap().unwrap();

    let table = services
        .existing_table("c1")
        .expect("dispatch creates the cluster table");
    assert_eq!(table.transaction_count(), 1);

    // One tick resets the expired transaction, the following tick erases it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(7);
    loop {
        if table.transaction_count() == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed-out transaction was never erased"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn suspended_request_does_not_reorder_the_stream() {
    let (upstream_addr, mut upstream_rx) = spawn_upstream().await;
    let clusters = ClusterManager::new();
    clusters.insert(Cluster::new("c1", vec![upstream_addr]));

    let mut config = proxy_config(vec![
        Route::new("proxy.pcsf.com", "c1"),
        Route::new("ex.com", "c1"),
    ]);
    config.settings.customized_affinity =
        vec![AffinityEntry::new(AffinitySource::RouteEp, "lskpmc")];
    config.settings.tra = Some(TraServiceConfig::default());
    // The key is never present: the lookup must run its course (delayed)
    // and degrade to a plain balancer pick.
    let transport = Arc::new(StaticTraTransport::new().with_delay(Duration::from_millis(100)));
    let (proxy_addr, _services) = start_proxy(config, clusters, Some(transport)).await;

    let mut client = Client::connect(proxy_addr).await;
    let mut batch = BytesMut::new();
    batch.extend_from_slice(&build_invite_with_route(
        "sip:alice@ex.com",
        "z9hG4bK-a",
        "cid-a",
        "<sip:proxy.pcsf.com;ep=never-cached>",
    ));
    batch.extend_from_slice(&build_invite("sip:alice@ex.com", "z9hG4bK-b", "cid-b"));
    batch.extend_from_slice(&build_invite("sip:alice@ex.com", "z9hG4bK-c", "cid-c"));
    client.send(&batch.freeze()).await;

    for expected in ["z9hG4bK-a", "z9hG4bK-b", "z9hG4bK-c"] {
        let msg = timeout(WAIT, upstream_rx.recv()).await.unwrap().unwrap();
        assert!(
            msg.text().contains(&format!("branch={}", expected)),
            "expected {} next, got: {}",
            expected,
            msg.text()
        );
    }
}

#[tokio::test]
async fn garbage_input_closes_the_connection() {
    let clusters = ClusterManager::new();
    let (proxy_addr, _services) = start_proxy(proxy_config(Vec::new()), clusters, None).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream.write_all(b"HELLO\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "undecodable input must close the connection");
}

#[tokio::test]
async fn oversize_body_closes_the_connection() {
    let clusters = ClusterManager::new();
    let (proxy_addr, _services) = start_proxy(proxy_config(Vec::new()), clusters, None).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let oversize = format!(
        "INVITE sip:alice@ex.com SIP/2.0\r\nVia: SIP/2.0/TCP d;branch=z9hG4bK-x\r\nContent-Length: {}\r\n\r\n",
        8 * 1024 * 1024
    );
    stream.write_all(oversize.as_bytes()).await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "an oversize Content-Length must close the connection");
}
