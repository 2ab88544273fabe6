//! Per-connection relay: sniff → resolve → connect → handshake → pump.
//!
//! A [`Relay`] runs as its own task and owns both sockets of one proxied
//! session. It publishes every state change through a `watch` channel (read
//! by the registry for diagnostics) and reports its end to the listener with
//! a single [`RelayEvent::Terminated`].

use super::{ConnId, ProxyContext, RelayEvent};
use fwdproxy_core::{
    connection_established, extract_target, parse_request, ProxyError, ProxyRequest, ProxyResult,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Read buffer size for each direction.
const READ_BUF_SIZE: usize = 8192;

/// Lifecycle of a relay. `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Waiting for a complete request head from the client.
    AwaitingRequest,
    /// Looking up the target host.
    Resolving,
    /// Connecting to the target.
    Connecting,
    /// Forwarding bytes in both directions.
    Relaying,
    /// Both sockets closed and the listener notified.
    Terminated,
}

/// The proxying engine for one client connection.
pub struct Relay {
    id: ConnId,
    ctx: Arc<ProxyContext>,
    /// Client-facing socket.
    downstream: TcpStream,
    /// Target-facing socket, present once the connect succeeded.
    upstream: Option<TcpStream>,
    state: RelayState,
    state_tx: watch::Sender<RelayState>,
    /// The first request, once parsed.
    request: Option<ProxyRequest>,
    events: mpsc::Sender<RelayEvent>,
}

impl Relay {
    /// Create a relay for an accepted connection.
    ///
    /// Returns the relay together with a receiver that always holds its
    /// current [`RelayState`].
    pub fn new(
        id: ConnId,
        downstream: TcpStream,
        ctx: Arc<ProxyContext>,
        events: mpsc::Sender<RelayEvent>,
    ) -> (Self, watch::Receiver<RelayState>) {
        let (state_tx, state_rx) = watch::channel(RelayState::AwaitingRequest);
        let relay = Self {
            id,
            ctx,
            downstream,
            upstream: None,
            state: RelayState::AwaitingRequest,
            state_tx,
            request: None,
            events,
        };
        (relay, state_rx)
    }

    /// Drive the relay to completion. Every exit path ends in
    /// [`Relay::terminate`].
    pub async fn run(mut self) {
        match self.drive().await {
            Ok(()) => debug!(conn_id = self.id, state = ?self.state(), "peer disconnected"),
            Err(e) => warn!(conn_id = self.id, state = ?self.state(), error = %e, "relay failed"),
        }
        self.terminate().await;
    }

    async fn drive(&mut self) -> ProxyResult<()> {
        let mut buf = Vec::with_capacity(READ_BUF_SIZE);
        let Some(request) = self.await_request(&mut buf).await? else {
            return Ok(());
        };

        let target = extract_target(request.method, &request.target)?;
        debug!(
            conn_id = self.id,
            method = %request.method,
            target = %target,
            version = %request.version,
            "request parsed"
        );

        self.set_state(RelayState::Resolving);
        let addrs = self.ctx.resolver.resolve(&target.host).await?;
        let ip = addrs
            .first()
            .copied()
            .ok_or_else(|| ProxyError::Resolve(format!("no addresses for {}", target.host)))?;

        self.set_state(RelayState::Connecting);
        let addr = SocketAddr::new(ip, target.port);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ProxyError::UpstreamConnect(format!("{}: {}", addr, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn_id = self.id, error = %e, "set_nodelay on upstream failed");
        }

        let upstream = self.upstream.insert(stream);
        if request.method.is_tunnel() {
            let response = connection_established(request.version, &self.ctx.agent);
            self.downstream.write_all(&response).await?;
            self.downstream.flush().await?;
            info!(conn_id = self.id, target = %target, upstream = %addr, "tunnel established");

            // Bytes the client pipelined behind the CONNECT head.
            let early = &buf[request.head_len..];
            if !early.is_empty() {
                upstream.write_all(early).await?;
                upstream.flush().await?;
            }
        } else {
            upstream.write_all(&buf).await?;
            upstream.flush().await?;
            info!(
                conn_id = self.id,
                method = %request.method,
                target = %target,
                upstream = %addr,
                "request forwarded"
            );
        }

        self.request = Some(request);
        self.set_state(RelayState::Relaying);
        self.pump().await
    }

    /// Read from the client until `buf` holds a complete request head.
    ///
    /// Returns `Ok(None)` if the client disconnects first.
    async fn await_request(&mut self, buf: &mut Vec<u8>) -> ProxyResult<Option<ProxyRequest>> {
        let mut chunk = [0u8; READ_BUF_SIZE];
        loop {
            let n = self.downstream.read(&mut chunk).await?;
            if n == 0 {
                debug!(
                    conn_id = self.id,
                    buffered = buf.len(),
                    "client closed before sending a request"
                );
                return Ok(None);
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(request) = parse_request(buf)? {
                return Ok(Some(request));
            }
            debug!(conn_id = self.id, buffered = buf.len(), "request head incomplete");
        }
    }

    /// Copy bytes both ways until either side reaches EOF or fails.
    async fn pump(&mut self) -> ProxyResult<()> {
        let Some(upstream) = self.upstream.as_mut() else {
            return Ok(());
        };
        let (mut down_read, mut down_write) = self.downstream.split();
        let (mut up_read, mut up_write) = upstream.split();

        tokio::select! {
            result = forward(&mut down_read, &mut up_write) => {
                let sent = result?;
                debug!(conn_id = self.id, bytes = sent, "client closed, client→target done");
            }
            result = forward(&mut up_read, &mut down_write) => {
                let received = result?;
                debug!(conn_id = self.id, bytes = received, "target closed, target→client done");
            }
        }
        Ok(())
    }

    /// Close both sockets and notify the listener.
    ///
    /// Only the first call has any effect; later calls return `false`.
    pub async fn terminate(&mut self) -> bool {
        if self.state == RelayState::Terminated {
            return false;
        }
        self.set_state(RelayState::Terminated);

        if let Err(e) = self.downstream.shutdown().await {
            debug!(conn_id = self.id, error = %e, "downstream shutdown failed");
        }
        if let Some(mut upstream) = self.upstream.take() {
            if let Err(e) = upstream.shutdown().await {
                debug!(conn_id = self.id, error = %e, "upstream shutdown failed");
            }
        }

        debug!(
            conn_id = self.id,
            target = self.request.as_ref().map(|r| r.target.as_str()),
            "relay terminated"
        );
        if self
            .events
            .send(RelayEvent::Terminated { id: self.id })
            .await
            .is_err()
        {
            debug!(conn_id = self.id, "event channel closed");
        }
        true
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn set_state(&mut self, next: RelayState) {
        debug!(conn_id = self.id, from = ?self.state, to = ?next, "state change");
        self.state = next;
        self.state_tx.send_replace(next);
    }
}

/// Copy `reader` into `writer` chunk by chunk, flushing after each write.
/// Returns the number of bytes copied once `reader` hits EOF.
async fn forward<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::{context, socket_pair, StaticResolver, TEST_HANDSHAKE};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        client: TcpStream,
        events: mpsc::Receiver<RelayEvent>,
        state: watch::Receiver<RelayState>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn start(id: ConnId, resolver: Arc<StaticResolver>) -> Harness {
        let (client, downstream) = socket_pair().await;
        let (events_tx, events) = mpsc::channel(8);
        let (relay, state) = Relay::new(id, downstream, context(resolver), events_tx);
        let task = tokio::spawn(relay.run());
        Harness {
            client,
            events,
            state,
            task,
        }
    }

    /// Read until EOF, returning everything the relay sent.
    async fn read_until_closed(client: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        timeout(WAIT, client.read_to_end(&mut out))
            .await
            .expect("relay did not close the client socket")
            .unwrap();
        out
    }

    async fn expect_single_termination(h: &mut Harness, id: ConnId) {
        let event = timeout(WAIT, h.events.recv()).await.unwrap();
        assert_eq!(event, Some(RelayEvent::Terminated { id }));
        timeout(WAIT, &mut h.task).await.unwrap().unwrap();
        // The relay dropped its sender; nothing else may follow.
        assert_eq!(h.events.recv().await, None);
        assert_eq!(*h.state.borrow(), RelayState::Terminated);
    }

    #[tokio::test]
    async fn connect_handshake_then_byte_exact_relay() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin_listener.local_addr().unwrap().port();
        let resolver = StaticResolver::loopback();
        let mut h = start(1, resolver.clone()).await;

        h.client
            .write_all(format!("CONNECT example.com:{port} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let (origin, _) = timeout(WAIT, origin_listener.accept()).await.unwrap().unwrap();

        let mut handshake = vec![0u8; TEST_HANDSHAKE.len()];
        timeout(WAIT, h.client.read_exact(&mut handshake))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handshake, TEST_HANDSHAKE);
        assert_eq!(resolver.calls(), 1);

        let client = std::mem::replace(&mut h.client, socket_pair().await.0);
        let (mut client_r, mut client_w) = client.into_split();
        let (mut origin_r, mut origin_w) = origin.into_split();

        // client → target, odd-sized chunks
        let upload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let expected = upload.clone();
        let writer = tokio::spawn(async move {
            for chunk in upload.chunks(997) {
                client_w.write_all(chunk).await.unwrap();
            }
            client_w
        });
        let mut got = vec![0u8; expected.len()];
        timeout(WAIT, origin_r.read_exact(&mut got)).await.unwrap().unwrap();
        assert_eq!(got, expected);
        let _client_w = writer.await.unwrap();

        // target → client, nothing may precede it
        let download: Vec<u8> = (0..150_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let expected = download.clone();
        let writer = tokio::spawn(async move {
            for chunk in download.chunks(4093) {
                origin_w.write_all(chunk).await.unwrap();
            }
            origin_w
        });
        let mut got = vec![0u8; expected.len()];
        timeout(WAIT, client_r.read_exact(&mut got)).await.unwrap().unwrap();
        assert_eq!(got, expected);

        // target hangs up → relay tears down the client side too
        drop(writer.await.unwrap());
        drop(origin_r);
        let mut rest = Vec::new();
        timeout(WAIT, client_r.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty(), "no bytes after the relayed data");

        expect_single_termination(&mut h, 1).await;
    }

    #[tokio::test]
    async fn request_head_split_across_segments() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin_listener.local_addr().unwrap().port();
        let mut h = start(2, StaticResolver::loopback()).await;

        let head = format!("CONNECT example.com:{port} HTTP/1.0\r\nHost: example.com\r\n\r\n");
        let (first, second) = head.as_bytes().split_at(10);
        h.client.write_all(first).await.unwrap();
        h.client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*h.state.borrow(), RelayState::AwaitingRequest);
        h.client.write_all(second).await.unwrap();

        let (_origin, _) = timeout(WAIT, origin_listener.accept()).await.unwrap().unwrap();
        let expected = b"HTTP/1.0 200 Connection established\r\nProxy-agent: fwdproxy-test/9.9.9\r\n\r\n";
        let mut handshake = vec![0u8; expected.len()];
        timeout(WAIT, h.client.read_exact(&mut handshake))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&handshake[..], &expected[..]);
    }

    #[tokio::test]
    async fn pipelined_bytes_after_connect_reach_target() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin_listener.local_addr().unwrap().port();
        let mut h = start(3, StaticResolver::loopback()).await;

        h.client
            .write_all(format!("CONNECT example.com:{port} HTTP/1.1\r\n\r\nhello").as_bytes())
            .await
            .unwrap();
        let (mut origin, _) = timeout(WAIT, origin_listener.accept()).await.unwrap().unwrap();

        let mut early = [0u8; 5];
        timeout(WAIT, origin.read_exact(&mut early)).await.unwrap().unwrap();
        assert_eq!(&early, b"hello");
    }

    #[tokio::test]
    async fn forward_request_is_sent_upstream_without_handshake() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin_listener.local_addr().unwrap().port();
        let mut h = start(4, StaticResolver::loopback()).await;

        let request = format!(
            "GET http://example.com:{port}/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
        h.client.write_all(request.as_bytes()).await.unwrap();

        let (mut origin, _) = timeout(WAIT, origin_listener.accept()).await.unwrap().unwrap();
        let mut got = vec![0u8; request.len()];
        timeout(WAIT, origin.read_exact(&mut got)).await.unwrap().unwrap();
        assert_eq!(got, request.as_bytes());

        let response = b"HTTP/1.1 204 No Content\r\n\r\n";
        origin.write_all(response).await.unwrap();
        drop(origin);

        assert_eq!(read_until_closed(&mut h.client).await, response);
        expect_single_termination(&mut h, 4).await;
    }

    #[tokio::test]
    async fn origin_form_target_terminates_without_lookup() {
        let resolver = StaticResolver::loopback();
        let mut h = start(5, resolver.clone()).await;

        h.client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        assert!(read_until_closed(&mut h.client).await.is_empty());
        expect_single_termination(&mut h, 5).await;
        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn resolver_failure_terminates_silently() {
        let resolver = StaticResolver::failing();
        let mut h = start(6, resolver.clone()).await;

        h.client
            .write_all(b"CONNECT nowhere.invalid:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        assert!(read_until_closed(&mut h.client).await.is_empty());
        expect_single_termination(&mut h, 6).await;
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn empty_resolution_terminates_silently() {
        let mut h = start(7, StaticResolver::answering(Vec::new())).await;

        h.client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        assert!(read_until_closed(&mut h.client).await.is_empty());
        expect_single_termination(&mut h, 7).await;
    }

    #[tokio::test]
    async fn upstream_refusal_terminates_silently() {
        // Grab a free port, then close it so the connect is refused.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let mut h = start(8, StaticResolver::loopback()).await;

        h.client
            .write_all(format!("CONNECT example.com:{port} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();

        assert!(read_until_closed(&mut h.client).await.is_empty());
        expect_single_termination(&mut h, 8).await;
    }

    #[tokio::test]
    async fn malformed_and_unsupported_requests_terminate() {
        for (id, raw) in [
            (9, &b"\x16\x03\x01\x00\xa5\x01\x00\x00\xa1\x03\x03"[..]),
            (10, &b"OPTIONS * HTTP/1.1\r\n\r\n"[..]),
        ] {
            let resolver = StaticResolver::loopback();
            let mut h = start(id, resolver.clone()).await;
            h.client.write_all(raw).await.unwrap();

            assert!(read_until_closed(&mut h.client).await.is_empty());
            expect_single_termination(&mut h, id).await;
            assert_eq!(resolver.calls(), 0);
        }
    }

    #[tokio::test]
    async fn client_leaving_before_request_terminates() {
        let mut h = start(11, StaticResolver::loopback()).await;
        h.client.shutdown().await.unwrap();
        expect_single_termination(&mut h, 11).await;
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (mut client, downstream) = socket_pair().await;
        let (events_tx, mut events) = mpsc::channel(8);
        let ctx = context(StaticResolver::loopback());
        let (mut relay, state) = Relay::new(12, downstream, ctx, events_tx);

        assert!(relay.terminate().await);
        assert!(!relay.terminate().await);
        assert_eq!(relay.state(), RelayState::Terminated);
        assert_eq!(*state.borrow(), RelayState::Terminated);
        drop(relay);

        assert_eq!(events.recv().await, Some(RelayEvent::Terminated { id: 12 }));
        assert_eq!(events.recv().await, None);
        assert!(read_until_closed(&mut client).await.is_empty());
    }
}
