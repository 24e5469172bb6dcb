//! Origin-facing sessions: resolve, connect and (for TLS) handshake.

use crate::error::ProxyError;
use crate::message::{BodyFraming, Parser, RequestHead, ResponseHead, Serializer};
use crate::session::{Session, SessionOptions, timed};
use crate::stream::HandshakeRole;
use http::Method;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use log::{debug, trace};
use std::io;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};

/// A [`Session`] that opens its own outbound connection.
#[derive(Debug)]
pub struct ClientSession {
    session: Session,
}

impl ClientSession {
    /// Plain or TLS client depending on `opts.tls`.
    pub fn new(opts: SessionOptions) -> Self {
        Self {
            session: Session::new(opts),
        }
    }

    /// Connects to `host` on `service`, a port number or `http`/`https`.
    ///
    /// For TLS sessions the SNI name is set from `host` before resolution and
    /// the client handshake runs after the TCP connection is up. Returns the
    /// endpoint that accepted the connection. On failure the session must be
    /// discarded.
    pub async fn connect(&mut self, host: &str, service: &str) -> Result<SocketAddr, ProxyError> {
        let timeout = self.session.opts().timeout;
        timed(timeout, self.connect_inner(host, service)).await
    }

    async fn connect_inner(&mut self, host: &str, service: &str) -> Result<SocketAddr, ProxyError> {
        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        let stream = self.session.stream_mut();
        if stream.is_secure() {
            stream.set_server_name(bare_host)?;
        }

        let port = service_port(service).ok_or_else(|| ProxyError::Resolve {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, format!("unknown service {:?}", service)),
        })?;

        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((bare_host, port))
            .await
            .map_err(|source| ProxyError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();
        trace!("{} resolved to {:?}", host, candidates);

        if candidates.is_empty() {
            return Err(ProxyError::Resolve {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            });
        }

        let mut last_error = None;
        let mut endpoint = None;
        for candidate in candidates {
            match stream.connect(candidate).await {
                Ok(()) => {
                    endpoint = Some(candidate);
                    break;
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", candidate, e);
                    last_error = Some(e);
                }
            }
        }

        let Some(endpoint) = endpoint else {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(ProxyError::Connect(format!("{}:{}: {}", host, port, reason)));
        };

        if stream.is_secure() {
            stream.handshake(HandshakeRole::Client).await?;
        }
        debug!("Connected to {} ({})", host, endpoint);
        Ok(endpoint)
    }

    /// Sends one request and reads the whole response.
    ///
    /// Used by tests and tooling rather than the relay path, which streams.
    pub async fn request(&mut self, mut head: RequestHead, body: &[u8]) -> Result<(ResponseHead, Vec<u8>), ProxyError> {
        let method = head.method.clone();
        if body.is_empty() && !matches!(method, Method::POST | Method::PUT | Method::PATCH) {
            head.headers.remove(CONTENT_LENGTH);
            head.headers.remove(TRANSFER_ENCODING);
            let mut serializer = Serializer::new(head, BodyFraming::Empty);
            self.session.write_header(&mut serializer).await?;
        } else {
            self.session.write_message(head, body).await?;
        }

        let mut parser = Parser::<ResponseHead>::new();
        parser.skip_body(method == Method::HEAD || method == Method::CONNECT);

        loop {
            self.session.read_header(&mut parser).await?;
            let informational = parser.head().is_some_and(|h| h.status.is_informational());
            if !informational {
                break;
            }
            parser = Parser::new();
            parser.skip_body(method == Method::HEAD || method == Method::CONNECT);
        }

        let mut payload = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let status = self.session.read(&mut parser, &mut chunk).await?;
            payload.extend_from_slice(&chunk[..status.filled()]);
            if status.is_complete() {
                break;
            }
        }

        let head = parser
            .release()
            .ok_or_else(|| ProxyError::parse("response finished without a header"))?;
        Ok((head, payload))
    }
}

impl Deref for ClientSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl DerefMut for ClientSession {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

fn service_port(service: &str) -> Option<u16> {
    match service {
        "http" => Some(80),
        "https" => Some(443),
        other => other.parse().ok(),
    }
}
