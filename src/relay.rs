//! Streams one request downstream → upstream and its response back through a
//! fixed-size transfer buffer.
//!
//! Each direction alternates a body read that fills the buffer with a write
//! of exactly the filled bytes. A read that stops because the buffer is full
//! is ordinary progress, not an error. Memory use per relay is the buffer
//! plus the sessions' own receive buffers, independent of body size.

use crate::error::ProxyError;
use crate::message::{BodyFraming, MessageHead, Parser, RequestHead, ResponseHead, Serializer, strip_hop_by_hop};
use crate::session::{ReadStatus, Session};
use http::header::CONTENT_LENGTH;
use http::{Method, StatusCode};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};

pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// What a finished relay moved and whether the downstream connection can
/// carry another request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub request_body_bytes: u64,
    pub response_body_bytes: u64,
    pub status: Option<StatusCode>,
    pub reusable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayEngine {
    buffer_size: usize,
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl RelayEngine {
    /// A zero size is bumped to one byte so every read makes progress.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Reads a request from `downstream` and relays it.
    pub async fn relay<D, U>(&self, downstream: &mut Session<D>, upstream: &mut Session<U>) -> Result<RelaySummary, ProxyError>
    where
        D: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut request = Parser::<RequestHead>::new();
        downstream.read_header(&mut request).await?;
        self.relay_request(downstream, upstream, request).await
    }

    /// Relays a request whose header `request` has already parsed.
    ///
    /// The head is forwarded as it stands in the parser, so callers may
    /// rewrite it first. Hop-by-hop headers are dropped in both directions
    /// after the client's keep-alive intent has been read, and the forwarded
    /// response carries `Connection: close` whenever the downstream
    /// connection cannot be reused. Any error leaves both sessions unusable.
    pub async fn relay_request<D, U>(
        &self,
        downstream: &mut Session<D>,
        upstream: &mut Session<U>,
        mut request: Parser<RequestHead>,
    ) -> Result<RelaySummary, ProxyError>
    where
        D: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut buffer = vec![0u8; self.buffer_size];

        let mut request_head = request
            .head()
            .cloned()
            .ok_or_else(|| ProxyError::parse("relay started before the request header"))?;
        let request_framing = request.framing().unwrap_or(BodyFraming::Empty);
        let bodiless_response = request_head.method == Method::HEAD;
        let request_keep_alive = request_head.keep_alive();
        strip_hop_by_hop(&mut request_head.headers);

        trace!("Relaying {} {}", request_head.method, request_head.target);
        let mut request_out = Serializer::new(request_head, request_framing);
        let request_body_bytes = transfer(downstream, &mut request, upstream, &mut request_out, &mut buffer).await?;

        let mut response = Parser::<ResponseHead>::new();
        response.skip_body(bodiless_response);
        upstream.read_header(&mut response).await?;

        while let Some(mut head) = response.head().filter(|h| is_interim(h.status)).cloned() {
            debug!("Forwarding interim {} response", head.status);
            strip_hop_by_hop(&mut head.headers);
            downstream
                .write_header(&mut Serializer::new(head, BodyFraming::Empty))
                .await?;
            response = Parser::new();
            response.skip_body(bodiless_response);
            upstream.read_header(&mut response).await?;
        }

        let mut response_head = response
            .head()
            .cloned()
            .ok_or_else(|| ProxyError::parse("response header missing"))?;
        let response_framing = response.framing().unwrap_or(BodyFraming::Empty);
        let status = response_head.status;
        let reusable = request_keep_alive && response_framing != BodyFraming::CloseDelimited;

        strip_hop_by_hop(&mut response_head.headers);
        if matches!(response_framing, BodyFraming::Chunked | BodyFraming::CloseDelimited) {
            response_head.headers.remove(CONTENT_LENGTH);
        }
        response_head.set_keep_alive(reusable);

        let mut response_out = Serializer::new(response_head, response_framing);
        let response_body_bytes = transfer(upstream, &mut response, downstream, &mut response_out, &mut buffer).await?;

        Ok(RelaySummary {
            request_body_bytes,
            response_body_bytes,
            status: Some(status),
            reusable,
        })
    }
}

/// 1xx responses other than 101 precede the final response.
fn is_interim(status: StatusCode) -> bool {
    status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS
}

/// Moves one message body from `source` to `sink` through `buffer`.
///
/// Writes the header first even when the body is empty. Returns the number of
/// body octets moved.
async fn transfer<H, S, T>(
    source: &mut Session<S>,
    parser: &mut Parser<H>,
    sink: &mut Session<T>,
    serializer: &mut Serializer<H>,
    buffer: &mut [u8],
) -> Result<u64, ProxyError>
where
    H: MessageHead,
    S: AsyncRead + AsyncWrite + Unpin + Send,
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    if !serializer.is_header_done() {
        sink.write_header(serializer).await?;
    }

    let mut moved = 0u64;
    while !serializer.is_done() {
        let (filled, more) = if parser.is_done() {
            (0, false)
        } else {
            match source.read(parser, buffer).await? {
                ReadStatus::NeedBuffer(n) => (n, true),
                ReadStatus::Complete(n) => (n, false),
            }
        };
        sink.write(serializer, &buffer[..filled], more).await?;
        moved += filled as u64;
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    struct Harness {
        downstream: Session<DuplexStream>,
        upstream: Session<DuplexStream>,
        client: DuplexStream,
        origin: DuplexStream,
    }

    fn harness() -> Harness {
        let (down, client) = duplex(256 * 1024);
        let (up, origin) = duplex(256 * 1024);
        Harness {
            downstream: Session::from_stream(down, SessionOptions::default()),
            upstream: Session::from_stream(up, SessionOptions::default()),
            client,
            origin,
        }
    }

    async fn read_until(stream: &mut DuplexStream, marker: &[u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        while !seen.windows(marker.len()).any(|w| w == marker) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed before {:?}", String::from_utf8_lossy(marker));
            seen.extend_from_slice(&buf[..n]);
        }
        seen
    }

    #[tokio::test]
    async fn test_relay_with_content_length_bodies() {
        let Harness {
            mut downstream,
            mut upstream,
            mut client,
            mut origin,
        } = harness();

        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut request = format!("POST /upload HTTP/1.1\r\nHost: o.test\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        request.extend_from_slice(&body);
        client.write_all(&request).await.unwrap();

        let origin_task = tokio::spawn(async move {
            let mut session = Session::from_stream(origin, SessionOptions::default());
            let mut parser = Parser::<RequestHead>::new();
            let received = session.discard_body(&mut parser).await.unwrap();
            let mut response = ResponseHead::new(StatusCode::CREATED);
            response.headers.insert("x-origin", "yes".parse().unwrap());
            session.write_message(response, b"stored").await.unwrap();
            received
        });

        let summary = RelayEngine::new(DEFAULT_BUFFER_SIZE)
            .relay(&mut downstream, &mut upstream)
            .await
            .unwrap();
        assert_eq!(summary.request_body_bytes, 10_000);
        assert_eq!(summary.response_body_bytes, 6);
        assert_eq!(summary.status, Some(StatusCode::CREATED));
        assert!(summary.reusable);
        assert_eq!(origin_task.await.unwrap(), 10_000);

        let reply = read_until(&mut client, b"stored").await;
        let text = String::from_utf8_lossy(&reply);
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("x-origin: yes\r\n"));
    }

    #[tokio::test]
    async fn test_chunked_response_through_tiny_buffer() {
        let Harness {
            mut downstream,
            mut upstream,
            mut client,
            mut origin,
        } = harness();

        client
            .write_all(b"GET /stream HTTP/1.1\r\nHost: o.test\r\n\r\n")
            .await
            .unwrap();

        let origin_task = tokio::spawn(async move {
            let seen = read_until(&mut origin, b"\r\n\r\n").await;
            origin
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n")
                .await
                .unwrap();
            seen
        });

        let summary = RelayEngine::new(3).relay(&mut downstream, &mut upstream).await.unwrap();
        assert_eq!(summary.response_body_bytes, 12);
        let forwarded = origin_task.await.unwrap();
        assert!(forwarded.starts_with(b"GET /stream HTTP/1.1\r\n"));

        let mut reader = Session::from_stream(client, SessionOptions::default());
        let mut parser = Parser::<ResponseHead>::new();
        let mut sink = [0u8; 64];
        let status = reader.read(&mut parser, &mut sink).await.unwrap();
        assert_eq!(status, ReadStatus::Complete(12));
        assert_eq!(&sink[..12], b"hello, world");
        assert_eq!(parser.framing(), Some(BodyFraming::Chunked));
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let Harness {
            mut downstream,
            mut upstream,
            mut client,
            mut origin,
        } = harness();

        client
            .write_all(b"HEAD / HTTP/1.1\r\nHost: o.test\r\n\r\n")
            .await
            .unwrap();
        tokio::spawn(async move {
            read_until(&mut origin, b"\r\n\r\n").await;
            origin
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5000\r\n\r\n")
                .await
                .unwrap();
        });

        let summary = RelayEngine::default().relay(&mut downstream, &mut upstream).await.unwrap();
        assert_eq!(summary.response_body_bytes, 0);
        assert!(summary.reusable);

        let reply = read_until(&mut client, b"\r\n\r\n").await;
        assert!(String::from_utf8_lossy(&reply).contains("content-length: 5000"));
    }

    #[tokio::test]
    async fn test_interim_response_forwarded() {
        let Harness {
            mut downstream,
            mut upstream,
            mut client,
            mut origin,
        } = harness();

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: o.test\r\n\r\n")
            .await
            .unwrap();
        tokio::spawn(async move {
            read_until(&mut origin, b"\r\n\r\n").await;
            origin
                .write_all(b"HTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let summary = RelayEngine::default().relay(&mut downstream, &mut upstream).await.unwrap();
        assert_eq!(summary.status, Some(StatusCode::OK));

        let reply = read_until(&mut client, b"ok").await;
        let text = String::from_utf8_lossy(&reply);
        assert!(text.starts_with("HTTP/1.1 103 Early Hints\r\n"));
        assert!(text.contains("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn test_close_delimited_response_is_not_reusable() {
        let Harness {
            mut downstream,
            mut upstream,
            mut client,
            mut origin,
        } = harness();

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: o.test\r\n\r\n")
            .await
            .unwrap();
        tokio::spawn(async move {
            read_until(&mut origin, b"\r\n\r\n").await;
            origin.write_all(b"HTTP/1.0 200 OK\r\n\r\nuntil close").await.unwrap();
            origin.shutdown().await.unwrap();
        });

        let summary = RelayEngine::default().relay(&mut downstream, &mut upstream).await.unwrap();
        assert_eq!(summary.response_body_bytes, 11);
        assert!(!summary.reusable);
        let reply = read_until(&mut client, b"until close").await;
        assert!(reply.starts_with(b"HTTP/1.0 200 OK\r\n"));
    }

    #[tokio::test]
    async fn test_upstream_failure_mid_body_is_error() {
        let Harness {
            mut downstream,
            mut upstream,
            mut client,
            mut origin,
        } = harness();

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: o.test\r\n\r\n")
            .await
            .unwrap();
        tokio::spawn(async move {
            read_until(&mut origin, b"\r\n\r\n").await;
            origin
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                .await
                .unwrap();
        });

        let err = RelayEngine::default()
            .relay(&mut downstream, &mut upstream)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Parse(_)));
    }

    #[tokio::test]
    async fn test_response_hop_by_hop_headers_are_rewritten() {
        let Harness {
            mut downstream,
            mut upstream,
            mut client,
            mut origin,
        } = harness();

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: o.test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let origin_task = tokio::spawn(async move {
            let seen = read_until(&mut origin, b"\r\n\r\n").await;
            origin
                .write_all(
                    b"HTTP/1.1 200 OK\r\nConnection: keep-alive, x-trace\r\nKeep-Alive: timeout=5\r\n\
X-Trace: 1\r\nProxy-Authenticate: Basic\r\nContent-Length: 2\r\n\r\nok",
                )
                .await
                .unwrap();
            String::from_utf8(seen).unwrap()
        });

        let summary = RelayEngine::default().relay(&mut downstream, &mut upstream).await.unwrap();
        assert!(!summary.reusable);
        assert!(!origin_task.await.unwrap().to_ascii_lowercase().contains("connection"));

        let reply = String::from_utf8(read_until(&mut client, b"ok").await).unwrap();
        let (head, body) = reply.split_once("\r\n\r\n").unwrap();
        assert_eq!(body, "ok");
        assert!(head.contains("connection: close"));
        assert!(head.contains("content-length: 2"));
        assert!(!head.contains("keep-alive"));
        assert!(!head.contains("x-trace"));
        assert!(!head.contains("proxy-authenticate"));
    }

    #[tokio::test]
    async fn test_rechunked_response_drops_content_length() {
        let Harness {
            mut downstream,
            mut upstream,
            mut client,
            mut origin,
        } = harness();

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: o.test\r\n\r\n")
            .await
            .unwrap();
        tokio::spawn(async move {
            read_until(&mut origin, b"\r\n\r\n").await;
            origin
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 99\r\n\r\n2\r\nok\r\n0\r\n\r\n")
                .await
                .unwrap();
        });

        let summary = RelayEngine::default().relay(&mut downstream, &mut upstream).await.unwrap();
        assert!(summary.reusable);

        let reply = String::from_utf8(read_until(&mut client, b"0\r\n\r\n").await).unwrap();
        let (head, _) = reply.split_once("\r\n\r\n").unwrap();
        assert!(head.contains("transfer-encoding: chunked"));
        assert!(!head.contains("content-length"));
        assert!(!head.contains("connection"));
    }

    #[tokio::test]
    async fn test_http10_keep_alive_client_is_reusable() {
        let Harness {
            mut downstream,
            mut upstream,
            mut client,
            mut origin,
        } = harness();

        client
            .write_all(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .await
            .unwrap();
        let origin_task = tokio::spawn(async move {
            let seen = read_until(&mut origin, b"\r\n\r\n").await;
            origin
                .write_all(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            String::from_utf8(seen).unwrap()
        });

        let summary = RelayEngine::default().relay(&mut downstream, &mut upstream).await.unwrap();
        assert!(summary.reusable);
        assert!(origin_task.await.unwrap().starts_with("GET / HTTP/1.0\r\n"));

        let reply = String::from_utf8(read_until(&mut client, b"ok").await).unwrap();
        assert!(reply.contains("connection: keep-alive\r\n"));
    }
}
