//! Accept loop and per-connection dispatch.
//!
//! Every accepted connection runs as its own task: read a request head,
//! classify it, then tunnel, relay or reject. A relayed exchange loops back
//! for the next request when the client asked for keep-alive and the response
//! had a delimited body; everything else ends with both sessions closed.

use crate::client::ClientSession;
use crate::config::{Config, PersistencePolicy};
use crate::error::ProxyError;
use crate::message::{BodyFraming, MessageHead, Parser, RequestHead, ResponseHead, Serializer};
use crate::metrics::ProxyMetrics;
use crate::relay::RelayEngine;
use crate::session::{Session, SessionOptions};
use crate::stream::HandshakeRole;
use crate::tls::{self, TlsContext};
use crate::tunnel;
use crate::uri::{Authority, UriParts};
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderValue, Method, StatusCode};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const LISTEN_BACKLOG: u32 = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Requests the proxy answers itself instead of forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    BodyNotSupported,
    MethodNotAllowed,
    Malformed,
    NotPersistent,
}

impl Rejection {
    pub fn status(self) -> StatusCode {
        match self {
            Rejection::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn body(self) -> &'static str {
        match self {
            Rejection::BodyNotSupported => "Messages with bodies are not supported for establishing a tunnel\n\n",
            Rejection::MethodNotAllowed => "Invalid request method. Only CONNECT is supported\n\n",
            Rejection::Malformed => {
                "Malformed client request. Use either CONNECT <authority-uri> or <verb> <absolute-uri>\n\n"
            }
            Rejection::NotPersistent => "Connection must be persistent to allow proper tunneling\n\n",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Tunnel(Authority),
    Relay(UriParts),
    Reject(Rejection),
}

/// Decides what to do with a request from its head alone.
pub fn classify(head: &RequestHead, persistence: PersistencePolicy) -> Dispatch {
    if persistence == PersistencePolicy::RequirePersistent && !head.keep_alive() {
        return Dispatch::Reject(Rejection::NotPersistent);
    }

    let is_connect = head.method == Method::CONNECT;
    if !is_connect {
        if let Ok(parts) = UriParts::parse(&head.target) {
            if parts.is_http() {
                return Dispatch::Relay(parts);
            }
        }
    }

    if head.has_body() {
        return Dispatch::Reject(Rejection::BodyNotSupported);
    }

    if !is_connect {
        return if head.target.starts_with('/') || head.target == "*" {
            Dispatch::Reject(Rejection::MethodNotAllowed)
        } else {
            Dispatch::Reject(Rejection::Malformed)
        };
    }

    match Authority::parse(&head.target) {
        Ok(authority) => Dispatch::Tunnel(authority),
        Err(_) => Dispatch::Reject(Rejection::Malformed),
    }
}

/// Rewrites an absolute-form request for the origin: origin-form target and
/// `Host` from the URI. Hop-by-hop headers are left for the relay to drop.
pub fn prepare_forwarded_request(head: &mut RequestHead, target: &UriParts) {
    if let Ok(host) = HeaderValue::from_str(&target.host_header()) {
        head.headers.insert(HOST, host);
    }
    head.target = target.origin_form();
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub listen_addr: SocketAddr,
    pub reuse_address: bool,
    /// Options for accepted sessions; a TLS context makes the listener TLS.
    pub accept_opts: SessionOptions,
    /// Options for origin sessions. Its TLS context is used for https relays
    /// only; tunnels are always plain proxy-side.
    pub connect_opts: SessionOptions,
    pub relay_buffer_size: usize,
    pub persistence: PersistencePolicy,
    pub announce_tunnel: bool,
}

impl ProxySettings {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            reuse_address: true,
            accept_opts: SessionOptions::default(),
            connect_opts: SessionOptions::default(),
            relay_buffer_size: crate::relay::DEFAULT_BUFFER_SIZE,
            persistence: PersistencePolicy::default(),
            announce_tunnel: true,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let base = SessionOptions {
            tls: None,
            timeout: config.timeout(),
            max_header_size: config.max_header_size,
        };

        let accept_tls = match &config.tls {
            Some(listener) => Some(TlsContext::server(Arc::new(tls::create_server_config(
                &listener.private_key,
                &listener.certificate,
            )?))),
            None => None,
        };
        let connect_tls = match &config.upstream_tls {
            Some(upstream) => TlsContext::client(Arc::new(tls::create_client_config(
                &upstream.ca_certificates,
                upstream.use_webpki_roots,
            )?)),
            None => TlsContext::webpki_client()?,
        };

        Ok(Self {
            listen_addr: config.listen_addr,
            reuse_address: config.reuse_address,
            accept_opts: base.clone().with_tls(accept_tls),
            connect_opts: base.with_tls(Some(connect_tls)),
            relay_buffer_size: config.relay_buffer_size,
            persistence: config.persistence,
            announce_tunnel: config.announce_tunnel,
        })
    }
}

/// A downstream connection currently being served.
#[derive(Debug, Clone)]
pub struct LiveConnection {
    pub id: u64,
    pub peer: SocketAddr,
    pub accepted_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    KeepAlive,
    Close,
}

struct Inner {
    settings: ProxySettings,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    live: Mutex<HashMap<u64, LiveConnection>>,
    next_id: AtomicU64,
    relay: RelayEngine,
    metrics: ProxyMetrics,
}

/// Forward proxy bound to one listening endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

impl Proxy {
    /// Binds the listener. Must be called within a Tokio runtime.
    ///
    /// Without a client TLS context in `connect_opts`, https origins are
    /// verified against the bundled webpki roots.
    pub fn bind(mut settings: ProxySettings) -> Result<Self, ProxyError> {
        if settings.connect_opts.tls.is_none() {
            settings.connect_opts.tls = Some(TlsContext::webpki_client()?);
        }

        let socket = if settings.listen_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(settings.reuse_address)?;
        socket.bind(settings.listen_addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;

        info!(
            "Forward proxy listening on {}{}",
            local_addr,
            if settings.accept_opts.tls.is_some() { " (TLS)" } else { "" }
        );

        Ok(Self {
            inner: Arc::new(Inner {
                relay: RelayEngine::new(settings.relay_buffer_size),
                settings,
                local_addr,
                listener: Mutex::new(Some(listener)),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                live: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                metrics: ProxyMetrics::new()?,
            }),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        Self::bind(ProxySettings::from_config(config)?)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.inner.settings
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.inner.metrics
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn live_connections(&self) -> Vec<LiveConnection> {
        match self.inner.live.lock() {
            Ok(live) => live.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Starts the accept loop on a background task.
    pub fn async_accept(&self) -> JoinHandle<()> {
        let proxy = self.clone();
        self.inner.tracker.spawn(async move { proxy.run().await })
    }

    /// Accepts connections until [`Proxy::cancel`] is called.
    pub async fn run(&self) {
        let listener = match self.inner.listener.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(listener) = listener else {
            warn!("Proxy on {} is already accepting or was cancelled", self.inner.local_addr);
            return;
        };

        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => Inner::spawn_connection(&self.inner, socket, peer),
                    Err(e) => {
                        error!("Accept on {} failed: {}", self.inner.local_addr, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        info!("Proxy on {} stopped accepting", self.inner.local_addr);
    }

    /// Stops accepting and tears down every live connection.
    pub fn cancel(&self) -> Result<(), ProxyError> {
        if self.inner.cancel.is_cancelled() {
            return Ok(());
        }
        self.inner.cancel.cancel();
        self.inner.tracker.close();

        let listener = self
            .inner
            .listener
            .lock()
            .map_err(|_| ProxyError::Io(io::Error::other("listener state poisoned")))?
            .take();
        drop(listener);

        let live = self
            .inner
            .live
            .lock()
            .map(|live| live.len())
            .map_err(|_| ProxyError::Io(io::Error::other("connection registry poisoned")))?;
        info!("Proxy on {} cancelled, closing {} live connections", self.inner.local_addr, live);
        Ok(())
    }

    /// Cancels and waits for the accept loop and all connection tasks.
    pub async fn shutdown(&self) -> Result<(), ProxyError> {
        self.cancel()?;
        self.inner.tracker.wait().await;
        Ok(())
    }
}

impl Inner {
    fn spawn_connection(inner: &Arc<Inner>, socket: TcpStream, peer: SocketAddr) {
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut live) = inner.live.lock() {
            live.insert(
                id,
                LiveConnection {
                    id,
                    peer,
                    accepted_at: Instant::now(),
                },
            );
        }
        inner.metrics.connections_accepted.inc();
        inner.metrics.connections_active.inc();
        debug!("Accepted connection {} from {}", id, peer);

        let task = Arc::clone(inner);
        let token = inner.cancel.child_token();
        inner.tracker.spawn(async move {
            tokio::select! {
                result = task.serve(socket, peer) => match result {
                    Ok(()) => debug!("Connection {} from {} closed", id, peer),
                    Err(e) if e.is_timeout() => debug!("Connection {} from {} timed out: {}", id, peer, e),
                    Err(e) => warn!("Connection {} from {} failed ({}): {}", id, peer, e.kind(), e),
                },
                _ = token.cancelled() => debug!("Connection {} from {} cancelled", id, peer),
            }

            if let Ok(mut live) = task.live.lock() {
                live.remove(&id);
            }
            task.metrics.connections_active.dec();
        });
    }

    async fn serve(&self, socket: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        let mut downstream = Session::from_socket(socket, self.settings.accept_opts.clone());
        if downstream.stream().is_secure() {
            downstream.handshake(HandshakeRole::Server).await?;
        }

        let mut served = 0u64;
        loop {
            let mut parser = Parser::<RequestHead>::new();
            match downstream.read_header(&mut parser).await {
                Ok(()) => {}
                Err(ProxyError::Transport(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) if served > 0 && e.is_timeout() => break,
                Err(ProxyError::Parse(reason)) => {
                    debug!("Malformed request from {}: {}", peer, reason);
                    self.reject(&mut downstream, Rejection::Malformed).await;
                    break;
                }
                Err(e) => return Err(e),
            }
            served += 1;

            if self.dispatch(&mut downstream, parser, peer).await? == Next::Close {
                break;
            }
        }

        downstream.close().await;
        Ok(())
    }

    async fn dispatch(&self, downstream: &mut Session, parser: Parser<RequestHead>, peer: SocketAddr) -> Result<Next, ProxyError> {
        let Some(head) = parser.head() else {
            return Err(ProxyError::parse("request header missing"));
        };
        debug!("{} {} {} from {}", head.method, head.target, version_label(head), peer);

        match classify(head, self.settings.persistence) {
            Dispatch::Reject(rejection) => {
                debug!("Rejecting request from {} with {}", peer, rejection.status());
                self.reject(downstream, rejection).await;
                Ok(Next::Close)
            }
            Dispatch::Tunnel(authority) => {
                self.tunnel(downstream, authority, peer).await?;
                Ok(Next::Close)
            }
            Dispatch::Relay(target) => self.relay(downstream, parser, target).await,
        }
    }

    async fn tunnel(&self, downstream: &mut Session, authority: Authority, peer: SocketAddr) -> Result<(), ProxyError> {
        let Some(mut upstream) = self
            .connect_upstream(downstream, &authority.host, authority.port, false)
            .await
        else {
            return Ok(());
        };

        if self.settings.announce_tunnel {
            let head = ResponseHead::with_reason(StatusCode::OK, "Connection Established");
            downstream
                .write_header(&mut Serializer::new(head, BodyFraming::Empty))
                .await?;
        }
        self.metrics.tunnels.inc();
        debug!("Tunnel {} <-> {} established", peer, authority);

        let result = tunnel::splice(downstream, &mut *upstream).await;
        upstream.close().await;
        let stats = result?;
        debug!(
            "Tunnel {} <-> {} closed after {} bytes up, {} bytes down",
            peer, authority, stats.client_to_origin, stats.origin_to_client
        );
        Ok(())
    }

    async fn relay(&self, downstream: &mut Session, mut parser: Parser<RequestHead>, target: UriParts) -> Result<Next, ProxyError> {
        if let Some(head) = parser.head_mut() {
            prepare_forwarded_request(head, &target);
        }

        let port = target.port_or_default();
        let Some(mut upstream) = self
            .connect_upstream(downstream, &target.host, port, target.is_secure())
            .await
        else {
            return Ok(Next::Close);
        };

        let result = self.relay.relay_request(downstream, &mut *upstream, parser).await;
        upstream.close().await;
        let summary = result?;

        self.metrics
            .record_relay(summary.request_body_bytes, summary.response_body_bytes);
        debug!(
            "Relayed {}://{}:{}{} -> {}",
            target.scheme,
            target.host,
            port,
            target.origin_form(),
            summary.status.map(|s| s.as_u16()).unwrap_or_default()
        );

        Ok(if summary.reusable {
            Next::KeepAlive
        } else {
            Next::Close
        })
    }

    /// Opens the origin session, answering the client with 400 on failure.
    async fn connect_upstream(&self, downstream: &mut Session, host: &str, port: u16, secure: bool) -> Option<ClientSession> {
        let opts = if secure {
            self.settings.connect_opts.clone()
        } else {
            self.settings.connect_opts.clone().with_tls(None)
        };

        let mut upstream = ClientSession::new(opts);
        match upstream.connect(host, &port.to_string()).await {
            Ok(endpoint) => {
                debug!("Upstream {}:{} connected via {}", host, port, endpoint);
                Some(upstream)
            }
            Err(e) => {
                warn!("Upstream {}:{} unavailable ({}): {}", host, port, e.kind(), e);
                self.metrics.record_upstream_failure(&e);
                self.metrics.record_rejection(StatusCode::BAD_REQUEST);
                let body = format!("Unable to connect to {}:{}: {}\n\n", host, port, e);
                self.respond_error(downstream, StatusCode::BAD_REQUEST, &body).await;
                None
            }
        }
    }

    async fn reject(&self, downstream: &mut Session, rejection: Rejection) {
        self.metrics.record_rejection(rejection.status());
        self.respond_error(downstream, rejection.status(), rejection.body()).await;
    }

    async fn respond_error(&self, downstream: &mut Session, status: StatusCode, body: &str) {
        let mut head = ResponseHead::new(status);
        head.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        head.set_keep_alive(false);
        if let Err(e) = downstream.write_message(head, body.as_bytes()).await {
            debug!("Failed to send {} response: {}", status, e);
        }
    }
}

fn version_label(head: &RequestHead) -> &'static str {
    if head.version() == http::Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::test_support::TestIdentity;

    fn request(method: Method, target: &str, headers: &[(&'static str, &'static str)]) -> RequestHead {
        let mut head = RequestHead::new(method, target);
        for (name, value) in headers {
            head.headers.append(*name, HeaderValue::from_static(*value));
        }
        head
    }

    #[test]
    fn test_classify_connect() {
        let head = request(Method::CONNECT, "www.google.com:1337", &[("connection", "keep-alive")]);
        assert_eq!(
            classify(&head, PersistencePolicy::AllowOneShot),
            Dispatch::Tunnel(Authority {
                host: "www.google.com".to_string(),
                port: 1337
            })
        );
    }

    #[test]
    fn test_classify_absolute_uri_relays() {
        let head = request(Method::GET, "https://www.example.test/search?q=rust", &[]);
        let Dispatch::Relay(parts) = classify(&head, PersistencePolicy::AllowOneShot) else {
            panic!("expected relay");
        };
        assert!(parts.is_secure());
        assert_eq!(parts.port_or_default(), 443);

        let post = request(Method::POST, "http://o.test/form", &[("content-length", "3")]);
        assert!(matches!(classify(&post, PersistencePolicy::AllowOneShot), Dispatch::Relay(_)));
    }

    #[test]
    fn test_classify_rejections() {
        let policy = PersistencePolicy::AllowOneShot;

        let connect_with_body = request(Method::CONNECT, "o.test:443", &[("content-length", "4")]);
        assert_eq!(
            classify(&connect_with_body, policy),
            Dispatch::Reject(Rejection::BodyNotSupported)
        );

        let get_with_body = request(Method::GET, "/", &[("transfer-encoding", "chunked")]);
        assert_eq!(classify(&get_with_body, policy), Dispatch::Reject(Rejection::BodyNotSupported));

        let relative = request(Method::GET, "/index.html", &[]);
        assert_eq!(classify(&relative, policy), Dispatch::Reject(Rejection::MethodNotAllowed));

        let connect_without_port = request(Method::CONNECT, "o.test", &[]);
        assert_eq!(classify(&connect_without_port, policy), Dispatch::Reject(Rejection::Malformed));

        let ftp = request(Method::GET, "ftp://o.test/file", &[]);
        assert_eq!(classify(&ftp, policy), Dispatch::Reject(Rejection::Malformed));

        let connect_absolute = request(Method::CONNECT, "http://o.test:80/", &[]);
        assert_eq!(classify(&connect_absolute, policy), Dispatch::Reject(Rejection::Malformed));
    }

    #[test]
    fn test_require_persistent_policy() {
        let one_shot = request(Method::CONNECT, "o.test:443", &[("connection", "close")]);
        assert!(matches!(
            classify(&one_shot, PersistencePolicy::AllowOneShot),
            Dispatch::Tunnel(_)
        ));
        assert_eq!(
            classify(&one_shot, PersistencePolicy::RequirePersistent),
            Dispatch::Reject(Rejection::NotPersistent)
        );
    }

    #[test]
    fn test_rejection_bodies() {
        assert_eq!(Rejection::MethodNotAllowed.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(Rejection::Malformed.status(), StatusCode::BAD_REQUEST);
        assert!(Rejection::BodyNotSupported.body().ends_with("\n\n"));
    }

    #[test]
    fn test_prepare_forwarded_request() {
        let mut head = request(
            Method::GET,
            "http://o.test:8080/a?b=1",
            &[
                ("host", "elsewhere.test"),
                ("connection", "close, x-private"),
                ("x-private", "secret"),
                ("proxy-authorization", "Basic Zm9vOmJhcg=="),
                ("keep-alive", "timeout=5"),
                ("accept", "*/*"),
            ],
        );
        let target = UriParts::parse(&head.target).unwrap();
        prepare_forwarded_request(&mut head, &target);

        assert_eq!(head.target, "/a?b=1");
        assert_eq!(head.headers.get(HOST).unwrap(), "o.test:8080");
        assert_eq!(head.headers.get("connection").unwrap(), "close, x-private");
        assert_eq!(head.headers.get("x-private").unwrap(), "secret");
        assert_eq!(head.headers.get("accept").unwrap(), "*/*");
    }

    /// Answers each request with `tls:` or `plain:` and the target it saw,
    /// depending on whether the connection opened with a TLS handshake.
    async fn dual_origin(identity: &TestIdentity) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server_ctx = identity.server_context();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let server_ctx = server_ctx.clone();
                tokio::spawn(async move {
                    let mut first = [0u8; 1];
                    if socket.peek(&mut first).await.unwrap() == 0 {
                        return;
                    }
                    let secure = first[0] == 0x16;
                    let opts = SessionOptions::default().with_tls(secure.then_some(server_ctx));
                    let mut session = Session::from_socket(socket, opts);
                    if secure {
                        session.handshake(HandshakeRole::Server).await.unwrap();
                    }
                    let mut parser = Parser::<RequestHead>::new();
                    session.read_header(&mut parser).await.unwrap();
                    let target = parser.head().unwrap().target.clone();
                    let body = format!("{}:{}", if secure { "tls" } else { "plain" }, target);
                    session
                        .write_message(ResponseHead::new(StatusCode::OK), body.as_bytes())
                        .await
                        .unwrap();
                    session.close().await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_tls_listener_relays_by_target_scheme() {
        let identity = TestIdentity::localhost();
        let origin_port = dual_origin(&identity).await;

        let mut settings = ProxySettings::new("127.0.0.1:0".parse().unwrap());
        settings.accept_opts = SessionOptions::default().with_tls(Some(identity.server_context()));
        settings.connect_opts = SessionOptions::default().with_tls(Some(identity.client_context()));
        let proxy = Proxy::bind(settings).unwrap();
        proxy.async_accept();
        let proxy_port = proxy.local_addr().port().to_string();

        for (scheme, expected) in [("https", "tls:/x?y=1"), ("http", "plain:/x?y=1")] {
            let mut client = ClientSession::new(SessionOptions::default().with_tls(Some(identity.client_context())));
            client.connect("localhost", &proxy_port).await.unwrap();

            let target = format!("{}://localhost:{}/x?y=1", scheme, origin_port);
            let head = request(Method::GET, &target, &[("connection", "close")]);
            let (response, body) = client.request(head, b"").await.unwrap();
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(String::from_utf8(body).unwrap(), expected);
        }

        proxy.shutdown().await.unwrap();
    }
}
