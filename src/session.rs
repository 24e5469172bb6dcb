//! Timed HTTP/1.x reads and writes over a single stream.

use crate::error::ProxyError;
use crate::message::{BodyFraming, MessageHead, Parser, Serializer};
use crate::stream::{DuplexStream, HandshakeRole};
use crate::tls::TlsContext;
use bytes::{Buf, BytesMut};
use http::HeaderValue;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use log::debug;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// TLS context; `Some` makes the session's stream a TLS stream.
    pub tls: Option<TlsContext>,
    /// Upper bound on every individual session operation.
    pub timeout: Duration,
    pub max_header_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            tls: None,
            timeout: DEFAULT_TIMEOUT,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }
}

impl SessionOptions {
    pub fn plain(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, tls: Option<TlsContext>) -> Self {
        self.tls = tls;
        self
    }
}

/// Outcome of a body read into a caller-supplied buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The buffer was filled and more body remains.
    NeedBuffer(usize),
    /// The message is complete; the count is the final fill.
    Complete(usize),
}

impl ReadStatus {
    pub fn filled(self) -> usize {
        match self {
            ReadStatus::NeedBuffer(n) | ReadStatus::Complete(n) => n,
        }
    }

    pub fn is_complete(self) -> bool {
        matches!(self, ReadStatus::Complete(_))
    }
}

/// A stream plus the receive buffer that carries bytes between reads.
///
/// Bytes read past the end of one message stay buffered for the next read,
/// or are handed over by [`Session::take_buffered`] when the connection
/// stops speaking HTTP.
#[derive(Debug)]
pub struct Session<S = DuplexStream> {
    stream: S,
    buffer: BytesMut,
    write_buffer: BytesMut,
    opts: SessionOptions,
}

impl Session<DuplexStream> {
    /// Unconnected session; TLS mode iff `opts.tls` is set.
    pub fn new(opts: SessionOptions) -> Self {
        Self::from_stream(DuplexStream::new(opts.tls.clone()), opts)
    }

    pub fn from_socket(socket: TcpStream, opts: SessionOptions) -> Self {
        Self::from_stream(DuplexStream::from_socket(socket, opts.tls.clone()), opts)
    }

    pub async fn handshake(&mut self, role: HandshakeRole) -> Result<(), ProxyError> {
        let timeout = self.opts.timeout;
        timed(timeout, self.stream.handshake(role)).await
    }

    /// Shuts down and releases the stream.
    pub async fn close(&mut self) {
        self.stream.shutdown().await;
        self.stream.close();
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn from_stream(stream: S, opts: SessionOptions) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            write_buffer: BytesMut::new(),
            opts,
        }
    }

    pub fn opts(&self) -> &SessionOptions {
        &self.opts
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Bytes received but not yet consumed by a parser.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn take_buffered(&mut self) -> BytesMut {
        self.buffer.split()
    }

    /// Reads until `parser` holds a complete header section.
    pub async fn read_header<H: MessageHead>(&mut self, parser: &mut Parser<H>) -> Result<(), ProxyError> {
        let timeout = self.opts.timeout;
        timed(timeout, self.read_header_inner(parser)).await
    }

    async fn read_header_inner<H: MessageHead>(&mut self, parser: &mut Parser<H>) -> Result<(), ProxyError> {
        loop {
            if !self.buffer.is_empty() {
                if let Some(len) = parser.parse_header(&self.buffer)? {
                    self.buffer.advance(len);
                    return Ok(());
                }
            }

            if self.buffer.len() >= self.opts.max_header_size {
                return Err(ProxyError::parse(format!(
                    "header section exceeds {} bytes",
                    self.opts.max_header_size
                )));
            }

            if self.fill().await? == 0 {
                return Err(if self.buffer.is_empty() {
                    ProxyError::transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before a message started",
                    ))
                } else {
                    ProxyError::parse("connection closed inside a header section")
                });
            }
        }
    }

    /// Reads the header if needed, then body octets into `sink`.
    ///
    /// The sink is filled completely unless the message ends first.
    pub async fn read<H: MessageHead>(&mut self, parser: &mut Parser<H>, sink: &mut [u8]) -> Result<ReadStatus, ProxyError> {
        let timeout = self.opts.timeout;
        timed(timeout, async {
            if !parser.is_header_done() {
                self.read_header_inner(parser).await?;
            }
            self.read_body_inner(parser, sink).await
        })
        .await
    }

    async fn read_body_inner<H: MessageHead>(&mut self, parser: &mut Parser<H>, sink: &mut [u8]) -> Result<ReadStatus, ProxyError> {
        let mut filled = 0;
        loop {
            if parser.is_done() {
                return Ok(ReadStatus::Complete(filled));
            }
            if filled == sink.len() {
                return Ok(ReadStatus::NeedBuffer(filled));
            }

            if !self.buffer.is_empty() {
                let (consumed, produced) = parser.decode_body(&self.buffer, &mut sink[filled..])?;
                self.buffer.advance(consumed);
                filled += produced;
                if consumed > 0 || produced > 0 {
                    continue;
                }
            }

            if self.fill().await? == 0 {
                parser.finish_on_eof()?;
            }
        }
    }

    /// Drains and discards the rest of a message body.
    pub async fn discard_body<H: MessageHead>(&mut self, parser: &mut Parser<H>) -> Result<u64, ProxyError> {
        let mut scratch = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            let status = self.read(parser, &mut scratch).await?;
            total += status.filled() as u64;
            if status.is_complete() {
                return Ok(total);
            }
        }
    }

    pub async fn write_header<H: MessageHead>(&mut self, serializer: &mut Serializer<H>) -> Result<(), ProxyError> {
        let timeout = self.opts.timeout;
        timed(timeout, async {
            self.write_buffer.clear();
            serializer.encode_header(&mut self.write_buffer);
            self.flush_write_buffer().await
        })
        .await
    }

    /// Writes one body slice, preceded by the header if not yet sent.
    /// `more == false` finishes the message.
    pub async fn write<H: MessageHead>(&mut self, serializer: &mut Serializer<H>, data: &[u8], more: bool) -> Result<usize, ProxyError> {
        let timeout = self.opts.timeout;
        timed(timeout, async {
            self.write_buffer.clear();
            if !serializer.is_header_done() {
                serializer.encode_header(&mut self.write_buffer);
            }
            serializer.encode_body(data, more, &mut self.write_buffer)?;
            self.flush_write_buffer().await?;
            Ok(data.len())
        })
        .await
    }

    /// Writes a complete message with a `Content-Length` body.
    pub async fn write_message<H: MessageHead>(&mut self, mut head: H, body: &[u8]) -> Result<(), ProxyError> {
        let headers = head.headers_mut();
        headers.remove(TRANSFER_ENCODING);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

        let mut serializer = Serializer::from_head(head)?;
        if serializer.framing() == BodyFraming::Empty {
            self.write_header(&mut serializer).await
        } else {
            self.write(&mut serializer, body, false).await.map(|_| ())
        }
    }

    /// Best-effort shutdown of the write side.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Ignoring shutdown error: {}", e);
        }
    }

    async fn fill(&mut self) -> Result<usize, ProxyError> {
        self.buffer.reserve(READ_CHUNK);
        self.stream.read_buf(&mut self.buffer).await.map_err(ProxyError::transport)
    }

    async fn flush_write_buffer(&mut self) -> Result<(), ProxyError> {
        self.stream
            .write_all(&self.write_buffer)
            .await
            .map_err(ProxyError::transport)?;
        self.stream.flush().await.map_err(ProxyError::transport)
    }
}

/// Bounds `op` by `timeout`, mapping expiry to [`ProxyError::Timeout`].
pub(crate) async fn timed<T>(timeout: Duration, op: impl Future<Output = Result<T, ProxyError>>) -> Result<T, ProxyError> {
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RequestHead, ResponseHead};
    use http::{Method, StatusCode};
    use tokio::io::{DuplexStream as Pipe, duplex};

    fn pair(timeout: Duration) -> (Session<Pipe>, Pipe) {
        let (ours, theirs) = duplex(64 * 1024);
        (Session::from_stream(ours, SessionOptions::plain(timeout)), theirs)
    }

    #[tokio::test]
    async fn test_read_header_keeps_leftover_bytes() {
        let (mut session, mut peer) = pair(Duration::from_secs(5));
        peer.write_all(b"CONNECT a.test:443 HTTP/1.1\r\nHost: a.test\r\n\r\n\x16\x03\x01")
            .await
            .unwrap();

        let mut parser = Parser::<RequestHead>::new();
        session.read_header(&mut parser).await.unwrap();
        assert_eq!(parser.head().unwrap().method, Method::CONNECT);
        assert_eq!(session.buffered(), b"\x16\x03\x01");
        assert_eq!(&session.take_buffered()[..], b"\x16\x03\x01");
        assert!(session.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_body_read_fills_sink_then_completes() {
        let (mut session, mut peer) = pair(Duration::from_secs(5));
        peer.write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789")
            .await
            .unwrap();

        let mut parser = Parser::<RequestHead>::new();
        let mut sink = [0u8; 4];
        assert_eq!(session.read(&mut parser, &mut sink).await.unwrap(), ReadStatus::NeedBuffer(4));
        assert_eq!(session.read(&mut parser, &mut sink).await.unwrap(), ReadStatus::NeedBuffer(4));
        assert_eq!(session.read(&mut parser, &mut sink).await.unwrap(), ReadStatus::Complete(2));
        assert_eq!(&sink[..2], b"89");
        assert!(parser.is_done());
    }

    #[tokio::test]
    async fn test_exact_fill_reports_complete() {
        let (mut session, mut peer) = pair(Duration::from_secs(5));
        peer.write_all(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd")
            .await
            .unwrap();

        let mut parser = Parser::<RequestHead>::new();
        let mut sink = [0u8; 4];
        assert_eq!(session.read(&mut parser, &mut sink).await.unwrap(), ReadStatus::Complete(4));
    }

    #[tokio::test]
    async fn test_close_delimited_body_ends_at_eof() {
        let (mut session, mut peer) = pair(Duration::from_secs(5));
        peer.write_all(b"HTTP/1.0 200 OK\r\n\r\nstreamed").await.unwrap();
        drop(peer);

        let mut parser = Parser::<ResponseHead>::new();
        let mut sink = [0u8; 64];
        let status = session.read(&mut parser, &mut sink).await.unwrap();
        assert_eq!(status, ReadStatus::Complete(8));
        assert_eq!(&sink[..8], b"streamed");
    }

    #[tokio::test]
    async fn test_truncated_body_is_parse_error() {
        let (mut session, mut peer) = pair(Duration::from_secs(5));
        peer.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort").await.unwrap();
        drop(peer);

        let mut parser = Parser::<ResponseHead>::new();
        let mut sink = [0u8; 64];
        let err = session.read(&mut parser, &mut sink).await.unwrap_err();
        assert!(matches!(err, ProxyError::Parse(_)));
    }

    #[tokio::test]
    async fn test_eof_before_message_is_transport_error() {
        let (mut session, peer) = pair(Duration::from_secs(5));
        drop(peer);

        let mut parser = Parser::<RequestHead>::new();
        let err = session.read_header(&mut parser).await.unwrap_err();
        assert!(matches!(err, ProxyError::Transport(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let (ours, mut peer) = duplex(64 * 1024);
        let opts = SessionOptions {
            max_header_size: 64,
            ..SessionOptions::plain(Duration::from_secs(5))
        };
        let mut session = Session::from_stream(ours, opts);
        let mut raw = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', 256));
        peer.write_all(&raw).await.unwrap();

        let mut parser = Parser::<RequestHead>::new();
        let err = session.read_header(&mut parser).await.unwrap_err();
        assert!(err.to_string().contains("exceeds 64 bytes"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_times_out() {
        let (mut session, _peer) = pair(Duration::from_millis(200));
        let mut parser = Parser::<RequestHead>::new();
        let err = session.read_header(&mut parser).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_chunked_write_and_read_back() {
        let (ours, theirs) = duplex(64 * 1024);
        let mut writer = Session::from_stream(ours, SessionOptions::default());
        let mut reader = Session::from_stream(theirs, SessionOptions::default());

        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let mut serializer = Serializer::new(head, BodyFraming::Chunked);
        writer.write(&mut serializer, b"hello ", true).await.unwrap();
        writer.write(&mut serializer, b"world", false).await.unwrap();
        assert!(serializer.is_done());

        let mut parser = Parser::<ResponseHead>::new();
        let mut sink = [0u8; 32];
        let status = reader.read(&mut parser, &mut sink).await.unwrap();
        assert_eq!(status, ReadStatus::Complete(11));
        assert_eq!(&sink[..11], b"hello world");
    }

    #[tokio::test]
    async fn test_write_message_sets_content_length() {
        let (ours, mut peer) = duplex(64 * 1024);
        let mut session = Session::from_stream(ours, SessionOptions::default());
        session
            .write_message(ResponseHead::new(StatusCode::BAD_REQUEST), b"nope\n\n")
            .await
            .unwrap();
        drop(session);

        let mut wire = Vec::new();
        peer.read_to_end(&mut wire).await.unwrap();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("content-length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\nnope\n\n"));
    }
}
