//! Plain or TLS byte stream with a mode fixed at construction.

use crate::error::ProxyError;
use crate::tls::TlsContext;
use log::debug;
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

/// A transport that is either plain TCP or TLS layered over TCP.
///
/// The variant never changes after construction. A TLS stream starts out
/// holding the raw socket and only carries application data once
/// [`DuplexStream::handshake`] has succeeded.
#[derive(Debug)]
pub enum DuplexStream {
    Plain(Option<TcpStream>),
    Tls(Box<TlsLayer>),
}

#[derive(Debug)]
pub struct TlsLayer {
    context: TlsContext,
    server_name: Option<ServerName<'static>>,
    state: TlsState,
}

#[derive(Debug)]
enum TlsState {
    Raw(Option<TcpStream>),
    Secured(TlsStream<TcpStream>),
    Closed,
}

fn not_connected(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, msg)
}

impl DuplexStream {
    /// Unconnected stream; TLS mode iff a context is supplied.
    pub fn new(tls: Option<TlsContext>) -> Self {
        Self::with_socket(None, tls)
    }

    /// Stream over an already connected (e.g. accepted) socket.
    pub fn from_socket(socket: TcpStream, tls: Option<TlsContext>) -> Self {
        Self::with_socket(Some(socket), tls)
    }

    fn with_socket(socket: Option<TcpStream>, tls: Option<TlsContext>) -> Self {
        match tls {
            Some(context) => DuplexStream::Tls(Box::new(TlsLayer {
                context,
                server_name: None,
                state: TlsState::Raw(socket),
            })),
            None => DuplexStream::Plain(socket),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, DuplexStream::Tls(_))
    }

    /// The raw TCP socket regardless of mode, if one is attached.
    pub fn underlying_socket(&self) -> Option<&TcpStream> {
        match self {
            DuplexStream::Plain(socket) => socket.as_ref(),
            DuplexStream::Tls(layer) => match &layer.state {
                TlsState::Raw(socket) => socket.as_ref(),
                TlsState::Secured(stream) => Some(stream.get_ref().0),
                TlsState::Closed => None,
            },
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.underlying_socket().and_then(|s| s.peer_addr().ok())
    }

    /// Connects the underlying socket. Only valid before any handshake.
    pub async fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        let slot = match self {
            DuplexStream::Plain(socket) => socket,
            DuplexStream::Tls(layer) => match &mut layer.state {
                TlsState::Raw(socket) => socket,
                _ => return Err(io::Error::other("stream is past the connect phase")),
            },
        };
        if slot.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "stream is already connected"));
        }

        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        *slot = Some(socket);
        Ok(())
    }

    /// Sets the SNI host name used by a client-role handshake.
    ///
    /// Purely local: fails with `TlsConfig` for names rustls cannot encode.
    pub fn set_server_name(&mut self, host: &str) -> Result<(), ProxyError> {
        let DuplexStream::Tls(layer) = self else {
            return Err(ProxyError::TlsConfig("server name requires a TLS stream".to_string()));
        };
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::TlsConfig(format!("invalid server name {:?}: {}", host, e)))?;
        layer.server_name = Some(name);
        Ok(())
    }

    pub async fn handshake(&mut self, role: HandshakeRole) -> Result<(), ProxyError> {
        let DuplexStream::Tls(layer) = self else {
            return Err(ProxyError::TlsConfig("handshake requires a TLS stream".to_string()));
        };

        let socket = match std::mem::replace(&mut layer.state, TlsState::Closed) {
            TlsState::Raw(Some(socket)) => socket,
            other => {
                layer.state = other;
                return Err(ProxyError::Handshake("no connected socket to secure".to_string()));
            }
        };

        let secured = match role {
            HandshakeRole::Client => {
                let config = layer.context.client_config().cloned().ok_or_else(|| {
                    ProxyError::TlsConfig("TLS context has no client configuration".to_string())
                })?;
                let name = layer.server_name.clone().ok_or_else(|| {
                    ProxyError::TlsConfig("client handshake without a server name".to_string())
                })?;
                TlsConnector::from(config)
                    .connect(name, socket)
                    .await
                    .map(TlsStream::Client)
            }
            HandshakeRole::Server => {
                let config = layer.context.server_config().cloned().ok_or_else(|| {
                    ProxyError::TlsConfig("TLS context has no server configuration".to_string())
                })?;
                TlsAcceptor::from(config).accept(socket).await.map(TlsStream::Server)
            }
        };

        let stream = secured.map_err(|e| ProxyError::Handshake(e.to_string()))?;
        debug!("TLS handshake complete ({:?})", role);
        layer.state = TlsState::Secured(stream);
        Ok(())
    }

    /// Best-effort write-side shutdown; the peer may already be gone.
    pub async fn shutdown(&mut self) {
        if let Err(e) = AsyncWriteExt::shutdown(self).await {
            debug!("Ignoring shutdown error: {}", e);
        }
    }

    /// Releases the transport. Never fails.
    pub fn close(&mut self) {
        match self {
            DuplexStream::Plain(socket) => {
                socket.take();
            }
            DuplexStream::Tls(layer) => layer.state = TlsState::Closed,
        }
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DuplexStream::Plain(Some(socket)) => Pin::new(socket).poll_read(cx, buf),
            DuplexStream::Plain(None) => Poll::Ready(Err(not_connected("stream is not connected"))),
            DuplexStream::Tls(layer) => match &mut layer.state {
                TlsState::Secured(stream) => Pin::new(stream).poll_read(cx, buf),
                TlsState::Raw(_) => Poll::Ready(Err(not_connected("TLS handshake has not completed"))),
                TlsState::Closed => Poll::Ready(Err(not_connected("stream is closed"))),
            },
        }
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DuplexStream::Plain(Some(socket)) => Pin::new(socket).poll_write(cx, buf),
            DuplexStream::Plain(None) => Poll::Ready(Err(not_connected("stream is not connected"))),
            DuplexStream::Tls(layer) => match &mut layer.state {
                TlsState::Secured(stream) => Pin::new(stream).poll_write(cx, buf),
                TlsState::Raw(_) => Poll::Ready(Err(not_connected("TLS handshake has not completed"))),
                TlsState::Closed => Poll::Ready(Err(not_connected("stream is closed"))),
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DuplexStream::Plain(Some(socket)) => Pin::new(socket).poll_flush(cx),
            DuplexStream::Tls(layer) => match &mut layer.state {
                TlsState::Secured(stream) => Pin::new(stream).poll_flush(cx),
                _ => Poll::Ready(Ok(())),
            },
            DuplexStream::Plain(None) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DuplexStream::Plain(Some(socket)) => Pin::new(socket).poll_shutdown(cx),
            DuplexStream::Tls(layer) => match &mut layer.state {
                TlsState::Secured(stream) => Pin::new(stream).poll_shutdown(cx),
                _ => Poll::Ready(Ok(())),
            },
            DuplexStream::Plain(None) => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::test_support::TestIdentity;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_stream_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = DuplexStream::from_socket(socket, None);
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = DuplexStream::new(None);
        assert!(!client.is_secure());
        assert!(client.underlying_socket().is_none());
        client.connect(addr).await.unwrap();
        assert_eq!(client.peer_addr(), Some(addr));

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_handshake_and_exchange() {
        let identity = TestIdentity::localhost();
        let server_ctx = identity.server_context();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut stream = DuplexStream::from_socket(socket, Some(server_ctx));
            stream.handshake(HandshakeRole::Server).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
            stream.shutdown().await;
        });

        let mut client = DuplexStream::new(Some(identity.client_context()));
        assert!(client.is_secure());
        client.set_server_name("localhost").unwrap();
        client.connect(addr).await.unwrap();
        client.handshake(HandshakeRole::Client).await.unwrap();
        assert!(client.underlying_socket().is_some());

        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_io_before_handshake_is_rejected() {
        let identity = TestIdentity::localhost();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _accept = tokio::spawn(async move { listener.accept().await });

        let mut client = DuplexStream::new(Some(identity.client_context()));
        client.connect(addr).await.unwrap();
        let err = client.write_all(b"plaintext").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_invalid_server_name() {
        let identity = TestIdentity::localhost();
        let mut stream = DuplexStream::new(Some(identity.client_context()));
        let err = stream.set_server_name("not a host name").unwrap_err();
        assert!(matches!(err, ProxyError::TlsConfig(_)));

        let mut plain = DuplexStream::new(None);
        assert!(matches!(plain.set_server_name("localhost"), Err(ProxyError::TlsConfig(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut stream = DuplexStream::new(None);
        stream.close();
        stream.close();
        stream.shutdown().await;
        assert!(stream.underlying_socket().is_none());
    }
}
