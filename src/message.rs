//! HTTP/1.x message heads and the incremental parser/serializer pair that
//! sessions drive.
//!
//! A [`Parser`] is fed raw bytes: first the header section, then body octets
//! which it decodes (content-length, chunked or read-until-close) into a
//! caller supplied sink. A [`Serializer`] does the reverse, re-framing body
//! slices for the wire. Neither type performs I/O.

use crate::error::ProxyError;
use bytes::{BufMut, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use std::fmt::Write as _;

const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 4096;

/// How the body following a head is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    CloseDelimited,
}

pub trait MessageHead: Clone + Send + Sync + 'static {
    /// Parses a complete header section, `None` while incomplete.
    /// On success also returns the header section length.
    fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, ProxyError>;

    fn version(&self) -> Version;

    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    fn framing(&self) -> Result<BodyFraming, ProxyError>;

    fn encode(&self, dst: &mut BytesMut);

    fn keep_alive(&self) -> bool {
        keep_alive(self.version(), self.headers())
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// True when a body follows the head. Unparseable framing counts as a body.
    pub fn has_body(&self) -> bool {
        !matches!(self.framing(), Ok(BodyFraming::Empty))
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        set_keep_alive(self.version, &mut self.headers, keep_alive);
    }
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_reason(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(status)
        }
    }

    /// The received reason phrase, or the canonical one.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        set_keep_alive(self.version, &mut self.headers, keep_alive);
    }
}

impl MessageHead for RequestHead {
    fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let status = req
            .parse(buf)
            .map_err(|e| ProxyError::parse(format!("invalid request head: {}", e)))?;

        let httparse::Status::Complete(len) = status else {
            return Ok(None);
        };

        let method = req
            .method
            .ok_or_else(|| ProxyError::parse("missing request method"))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ProxyError::parse(format!("invalid request method: {}", e)))?;
        let target = req
            .path
            .ok_or_else(|| ProxyError::parse("missing request target"))?
            .to_string();

        Ok(Some((
            len,
            RequestHead {
                method,
                target,
                version: version_from(req.version),
                headers: header_map(req.headers)?,
            },
        )))
    }

    fn version(&self) -> Version {
        self.version
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn framing(&self) -> Result<BodyFraming, ProxyError> {
        let length = content_length(&self.headers)?;
        match transfer_chunked(&self.headers) {
            Some(_) if length.is_some() => Err(ProxyError::parse(
                "request carries both Transfer-Encoding and Content-Length",
            )),
            Some(true) => Ok(BodyFraming::Chunked),
            Some(false) => Err(ProxyError::parse(
                "request Transfer-Encoding must end with chunked",
            )),
            None => Ok(match length {
                Some(0) | None => BodyFraming::Empty,
                Some(n) => BodyFraming::Length(n),
            }),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        let _ = write!(dst, "{} {} {}\r\n", self.method, self.target, version_str(self.version));
        encode_headers(&self.headers, dst);
    }
}

impl MessageHead for ResponseHead {
    fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        let status = res
            .parse(buf)
            .map_err(|e| ProxyError::parse(format!("invalid response head: {}", e)))?;

        let httparse::Status::Complete(len) = status else {
            return Ok(None);
        };

        let code = res
            .code
            .ok_or_else(|| ProxyError::parse("missing response status code"))?;
        let status = StatusCode::from_u16(code)
            .map_err(|e| ProxyError::parse(format!("invalid status code: {}", e)))?;

        Ok(Some((
            len,
            ResponseHead {
                version: version_from(res.version),
                status,
                reason: res.reason.filter(|r| !r.is_empty()).map(ToOwned::to_owned),
                headers: header_map(res.headers)?,
            },
        )))
    }

    fn version(&self) -> Version {
        self.version
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn framing(&self) -> Result<BodyFraming, ProxyError> {
        if self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return Ok(BodyFraming::Empty);
        }
        match transfer_chunked(&self.headers) {
            Some(true) => Ok(BodyFraming::Chunked),
            Some(false) => Ok(BodyFraming::CloseDelimited),
            None => Ok(match content_length(&self.headers)? {
                Some(0) => BodyFraming::Empty,
                Some(n) => BodyFraming::Length(n),
                None => BodyFraming::CloseDelimited,
            }),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        let _ = write!(
            dst,
            "{} {} {}\r\n",
            version_str(self.version),
            self.status.as_u16(),
            self.reason()
        );
        encode_headers(&self.headers, dst);
    }
}

fn version_from(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

fn header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| ProxyError::parse(format!("invalid header name {:?}: {}", h.name, e)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|e| ProxyError::parse(format!("invalid value for header {}: {}", h.name, e)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn encode_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

fn header_tokens<'a>(headers: &'a HeaderMap, name: &HeaderName) -> impl Iterator<Item = &'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Header names listed in `Connection`, lowercased.
pub(crate) fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    header_tokens(headers, &CONNECTION)
        .map(str::to_ascii_lowercase)
        .collect()
}

pub(crate) fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let tokens = connection_tokens(headers);
    if tokens.iter().any(|t| t == "close") {
        return false;
    }
    version != Version::HTTP_10 || tokens.iter().any(|t| t == "keep-alive")
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

/// Removes hop-by-hop headers and every header named in `Connection`.
/// Framing headers are kept even when listed.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed = connection_tokens(headers);
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    for name in listed {
        if name != CONTENT_LENGTH.as_str() && name != TRANSFER_ENCODING.as_str() {
            headers.remove(name.as_str());
        }
    }
}

fn set_keep_alive(version: Version, headers: &mut HeaderMap, keep_alive: bool) {
    let value = match (keep_alive, version == Version::HTTP_10) {
        (false, _) => Some("close"),
        (true, true) => Some("keep-alive"),
        (true, false) => None,
    };
    headers.remove(CONNECTION);
    if let Some(value) = value {
        headers.insert(CONNECTION, HeaderValue::from_static(value));
    }
}

/// `Some(true)` when the final transfer coding is chunked.
fn transfer_chunked(headers: &HeaderMap) -> Option<bool> {
    if !headers.contains_key(TRANSFER_ENCODING) {
        return None;
    }
    Some(
        header_tokens(headers, &TRANSFER_ENCODING)
            .last()
            .is_some_and(|coding| coding.eq_ignore_ascii_case("chunked")),
    )
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProxyError> {
    let mut length = None;
    for token in header_tokens(headers, &CONTENT_LENGTH) {
        if !token.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProxyError::parse(format!("invalid Content-Length {:?}", token)));
        }
        let n: u64 = token
            .parse()
            .map_err(|_| ProxyError::parse(format!("Content-Length out of range: {}", token)))?;
        match length {
            Some(existing) if existing != n => {
                return Err(ProxyError::parse("conflicting Content-Length values"));
            }
            _ => length = Some(n),
        }
    }
    Ok(length)
}

/// Splits off one line terminated by LF, tolerating a missing CR.
/// Returns the line content and the number of bytes including the terminator.
fn take_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let end = buf.iter().position(|&b| b == b'\n')?;
    let line = &buf[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, end + 1))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ProxyError> {
    let size = line.split(|&b| b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size)
        .map_err(|_| ProxyError::parse("chunk size is not ASCII"))?
        .trim();
    if size.is_empty() {
        return Err(ProxyError::parse("empty chunk size line"));
    }
    u64::from_str_radix(size, 16).map_err(|e| ProxyError::parse(format!("invalid chunk size {:?}: {}", size, e)))
}

#[derive(Debug)]
enum Decoder {
    AwaitingHeader,
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
    Done,
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

/// Incremental parser for one message.
#[derive(Debug)]
pub struct Parser<H> {
    head: Option<H>,
    framing: Option<BodyFraming>,
    skip_body: bool,
    decoder: Decoder,
    body_bytes: u64,
}

impl<H: MessageHead> Default for Parser<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: MessageHead> Parser<H> {
    pub fn new() -> Self {
        Self {
            head: None,
            framing: None,
            skip_body: false,
            decoder: Decoder::AwaitingHeader,
            body_bytes: 0,
        }
    }

    /// Treat the message as bodiless regardless of its headers, as for a
    /// response to HEAD or a successful CONNECT.
    pub fn skip_body(&mut self, skip: bool) {
        self.skip_body = skip;
    }

    pub fn is_header_done(&self) -> bool {
        self.head.is_some()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.decoder, Decoder::Done)
    }

    pub fn head(&self) -> Option<&H> {
        self.head.as_ref()
    }

    pub fn head_mut(&mut self) -> Option<&mut H> {
        self.head.as_mut()
    }

    pub fn framing(&self) -> Option<BodyFraming> {
        self.framing
    }

    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    pub fn release(self) -> Option<H> {
        self.head
    }

    /// Consumes a complete header section from `buf`, returning its length.
    pub(crate) fn parse_header(&mut self, buf: &[u8]) -> Result<Option<usize>, ProxyError> {
        if self.head.is_some() {
            return Err(ProxyError::parse("header already parsed"));
        }
        let Some((len, head)) = H::parse(buf)? else {
            return Ok(None);
        };

        let framing = if self.skip_body {
            BodyFraming::Empty
        } else {
            head.framing()?
        };
        self.decoder = match framing {
            BodyFraming::Empty => Decoder::Done,
            BodyFraming::Length(n) => Decoder::Length(n),
            BodyFraming::Chunked => Decoder::Chunked(ChunkState::Size),
            BodyFraming::CloseDelimited => Decoder::UntilClose,
        };
        self.framing = Some(framing);
        self.head = Some(head);
        Ok(Some(len))
    }

    /// Decodes body octets from `input` into `output`.
    ///
    /// Returns `(consumed, produced)`. Stops when the message is complete,
    /// `output` is full, or `input` holds no further decodable bytes.
    pub(crate) fn decode_body(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), ProxyError> {
        let mut consumed = 0;
        let mut produced = 0;

        loop {
            let rest = &input[consumed..];
            let space = output.len() - produced;

            match &mut self.decoder {
                Decoder::AwaitingHeader => return Err(ProxyError::parse("body requested before header")),
                Decoder::Done => break,
                Decoder::Length(remaining) => {
                    let n = (*remaining).min(rest.len() as u64).min(space as u64) as usize;
                    output[produced..produced + n].copy_from_slice(&rest[..n]);
                    consumed += n;
                    produced += n;
                    *remaining -= n as u64;
                    let finished = *remaining == 0;
                    if finished {
                        self.decoder = Decoder::Done;
                    }
                    break;
                }
                Decoder::UntilClose => {
                    let n = rest.len().min(space);
                    output[produced..produced + n].copy_from_slice(&rest[..n]);
                    consumed += n;
                    produced += n;
                    break;
                }
                Decoder::Chunked(state) => match state {
                    ChunkState::Size => {
                        let Some((line, used)) = take_line(rest) else {
                            if rest.len() > MAX_CHUNK_LINE {
                                return Err(ProxyError::parse("chunk size line too long"));
                            }
                            break;
                        };
                        let size = parse_chunk_size(line)?;
                        consumed += used;
                        *state = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    ChunkState::Data(remaining) => {
                        let n = (*remaining).min(rest.len() as u64).min(space as u64) as usize;
                        if n == 0 {
                            break;
                        }
                        output[produced..produced + n].copy_from_slice(&rest[..n]);
                        consumed += n;
                        produced += n;
                        *remaining -= n as u64;
                        let chunk_finished = *remaining == 0;
                        if chunk_finished {
                            *state = ChunkState::DataEnd;
                        }
                    }
                    ChunkState::DataEnd => {
                        let Some((line, used)) = take_line(rest) else {
                            if rest.len() > 2 {
                                return Err(ProxyError::parse("missing CRLF after chunk data"));
                            }
                            break;
                        };
                        if !line.is_empty() {
                            return Err(ProxyError::parse("missing CRLF after chunk data"));
                        }
                        consumed += used;
                        *state = ChunkState::Size;
                    }
                    ChunkState::Trailer => {
                        let Some((line, used)) = take_line(rest) else {
                            if rest.len() > MAX_CHUNK_LINE {
                                return Err(ProxyError::parse("trailer line too long"));
                            }
                            break;
                        };
                        consumed += used;
                        if line.is_empty() {
                            self.decoder = Decoder::Done;
                        }
                    }
                },
            }
        }

        self.body_bytes += produced as u64;
        Ok((consumed, produced))
    }

    /// Accounts for the peer closing its write side.
    pub(crate) fn finish_on_eof(&mut self) -> Result<(), ProxyError> {
        match self.decoder {
            Decoder::UntilClose | Decoder::Done => {
                self.decoder = Decoder::Done;
                Ok(())
            }
            _ => Err(ProxyError::parse("connection closed before the message was complete")),
        }
    }
}

/// Serializer for one outgoing message.
#[derive(Debug)]
pub struct Serializer<H> {
    head: H,
    framing: BodyFraming,
    header_done: bool,
    done: bool,
    written: u64,
}

impl<H: MessageHead> Serializer<H> {
    pub fn new(head: H, framing: BodyFraming) -> Self {
        Self {
            head,
            framing,
            header_done: false,
            done: false,
            written: 0,
        }
    }

    /// Serializer whose framing is derived from the head's own headers.
    pub fn from_head(head: H) -> Result<Self, ProxyError> {
        let framing = head.framing()?;
        Ok(Self::new(head, framing))
    }

    pub fn head(&self) -> &H {
        &self.head
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn is_header_done(&self) -> bool {
        self.header_done
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn body_bytes(&self) -> u64 {
        self.written
    }

    pub(crate) fn encode_header(&mut self, dst: &mut BytesMut) {
        self.head.encode(dst);
        self.header_done = true;
        if self.framing == BodyFraming::Empty {
            self.done = true;
        }
    }

    /// Frames `data` for the wire. `more == false` marks the final slice.
    pub(crate) fn encode_body(&mut self, data: &[u8], more: bool, dst: &mut BytesMut) -> Result<(), ProxyError> {
        if !self.header_done {
            return Err(ProxyError::parse("body serialized before header"));
        }
        if self.done {
            return if data.is_empty() {
                Ok(())
            } else {
                Err(ProxyError::parse("body data after the end of the message"))
            };
        }

        match self.framing {
            BodyFraming::Empty => return Err(ProxyError::parse("body data for a bodiless message")),
            BodyFraming::Length(total) => {
                let after = self.written + data.len() as u64;
                if after > total {
                    return Err(ProxyError::parse("body exceeds Content-Length"));
                }
                if !more && after != total {
                    return Err(ProxyError::parse("body shorter than Content-Length"));
                }
                dst.put_slice(data);
            }
            BodyFraming::Chunked => {
                if !data.is_empty() {
                    let _ = write!(dst, "{:x}\r\n", data.len());
                    dst.put_slice(data);
                    dst.put_slice(b"\r\n");
                }
                if !more {
                    dst.put_slice(b"0\r\n\r\n");
                }
            }
            BodyFraming::CloseDelimited => dst.put_slice(data),
        }

        self.written += data.len() as u64;
        if !more {
            self.done = true;
        }
        Ok(())
    }
}
