use std::io;

use http::{Method, StatusCode, Version};
use n0_error::{Result, StackResultExt, StdResultExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::prebuffered::Prebuffered;

/// Header pairs in wire order with original casing.
///
/// The broker forwards heads verbatim, so headers are kept exactly as
/// received instead of being folded into a canonicalizing map. Lookups the
/// broker itself needs (`Host`, `Upgrade`) are case-insensitive and return
/// the first match.
#[derive(Debug, Clone, Default)]
pub struct RawHeaders(Vec<(String, Vec<u8>)>);

impl RawHeaders {
    fn from_httparse(headers: &[httparse::Header<'_>]) -> Self {
        Self(
            headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        )
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// First value for `name` as UTF-8, if it is valid UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Header pairs in the order they appeared on the wire.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.push((name.into(), value.into()));
    }

    fn has_chunked_encoding(&self) -> bool {
        self.get_str("transfer-encoding")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
            .unwrap_or(false)
    }

    fn content_length(&self) -> Option<u64> {
        self.get_str("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        for (name, value) in &self.0 {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value);
            buf.extend_from_slice(b"\r\n");
        }
    }
}

/// How an HTTP/1.x message delimits its body.
///
/// The broker forwards bodies byte-for-byte but must know where a message
/// ends: tunnel sockets stay open across the HTTP exchange, so end-of-body
/// cannot be inferred from end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    /// Exactly this many body bytes follow.
    Length(u64),
    /// Chunked transfer coding; the terminal chunk ends the body.
    Chunked,
    /// The body runs until the peer closes the connection (responses only).
    UntilClose,
}

fn version_from_httparse(version: Option<u8>) -> Result<Version> {
    match version {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported HTTP version").into()),
    }
}

/// Parsed HTTP/1.x request line and header section.
///
/// The request target is kept exactly as received, including the query
/// string; the broker never rewrites it.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// HTTP method from the request line.
    pub method: Method,
    /// Request target as received (path and query, untouched).
    pub target: String,
    /// HTTP version from the request line.
    pub version: Version,
    /// Raw headers in wire order.
    pub headers: RawHeaders,
}

impl RequestHead {
    /// Parses a request head from a buffer; `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, head)| head))
    }

    /// Parses a request head from a buffer; `None` when incomplete.
    ///
    /// Returns the length of the head section and the head.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(head_len) => {
                let method = req
                    .method
                    .context("missing HTTP method")?
                    .parse::<Method>()
                    .std_context("invalid HTTP method")?;
                let target = req.path.context("missing request target")?.to_string();
                let version = version_from_httparse(req.version)?;
                let head = Self {
                    method,
                    target,
                    version,
                    headers: RawHeaders::from_httparse(req.headers),
                };
                Ok(Some((head_len, head)))
            }
        }
    }

    /// Reads and parses the request line and header section.
    ///
    /// Does not remove the head section from `reader`. Returns
    /// [`io::ErrorKind::OutOfMemory`] if the head exceeds the buffer limit.
    pub async fn peek(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<(usize, Self)> {
        while !reader.is_full() {
            reader.buffer_more().await?;
            if let Some(head) = Self::parse_with_len(reader.buffer())? {
                return Ok(head);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "buffer size limit reached before end of request head",
        )
        .into())
    }

    /// Reads and parses the request line and header section, consuming it
    /// from `reader`.
    pub async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Self> {
        let (len, head) = Self::peek(reader).await?;
        reader.discard(len);
        Ok(head)
    }

    /// Host header value, if present and valid UTF-8.
    pub fn host(&self) -> Option<&str> {
        self.headers.get_str("host")
    }

    /// Upgrade header value, if present; `Some("websocket")` for WebSocket
    /// handshakes.
    pub fn upgrade(&self) -> Option<&str> {
        self.headers.get_str("upgrade")
    }

    /// How this request's body is delimited.
    ///
    /// A request carries a body only when the head announces one; there is
    /// no read-until-close framing on the request side.
    pub fn body_framing(&self) -> BodyFraming {
        if self.headers.has_chunked_encoding() {
            BodyFraming::Chunked
        } else {
            match self.headers.content_length() {
                Some(0) | None => BodyFraming::None,
                Some(len) => BodyFraming::Length(len),
            }
        }
    }

    /// Serializes the head exactly as it will appear on the wire: request
    /// line, headers in original order and casing, blank line.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(
            format!("{} {} {:?}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        self.headers.encode_into(&mut buf);
        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Writes the serialized head to `writer`.
    pub async fn write(&self, writer: &mut (impl AsyncWrite + Send + Unpin)) -> io::Result<()> {
        writer.write_all(&self.encode()).await
    }
}

/// Parsed HTTP/1.x response status line and header section.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Status code from the status line.
    pub status: StatusCode,
    /// Reason phrase as received, if present.
    pub reason: Option<String>,
    /// HTTP version from the status line.
    pub version: Version,
    /// Raw headers in wire order.
    pub headers: RawHeaders,
}

impl ResponseHead {
    pub(crate) fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: RawHeaders::default(),
        }
    }

    /// A response head with an explicit empty body, for synthesized errors.
    pub(crate) fn no_body(status: StatusCode) -> Self {
        let mut head = Self::new(status);
        head.headers.push("Content-Length", &b"0"[..]);
        head
    }

    /// Reason phrase as received, or the canonical phrase for the status.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Parses a response head from a buffer; `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, head)| head))
    }

    /// Parses a response head from a buffer; `None` when incomplete.
    ///
    /// Returns the length of the head section and the head.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(head_len) => {
                let code = res.code.context("missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("invalid response status code")?;
                let head = Self {
                    status,
                    reason: res.reason.filter(|r| !r.is_empty()).map(ToOwned::to_owned),
                    version: version_from_httparse(res.version)?,
                    headers: RawHeaders::from_httparse(res.headers),
                };
                Ok(Some((head_len, head)))
            }
        }
    }

    /// How this response's body is delimited, for a request with `method`.
    pub fn body_framing(&self, method: &Method) -> BodyFraming {
        if *method == Method::HEAD
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return BodyFraming::None;
        }
        if self.headers.has_chunked_encoding() {
            BodyFraming::Chunked
        } else {
            match self.headers.content_length() {
                Some(0) => BodyFraming::None,
                Some(len) => BodyFraming::Length(len),
                None => BodyFraming::UntilClose,
            }
        }
    }

    /// Reads and parses the status line and header section.
    ///
    /// Does not remove the head section from `reader`. Returns
    /// [`io::ErrorKind::OutOfMemory`] if the head exceeds the buffer limit.
    async fn peek(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<(usize, Self)> {
        while !reader.is_full() {
            reader.buffer_more().await?;
            if let Some(head) = Self::parse_with_len(reader.buffer())? {
                return Ok(head);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "buffer size limit reached before end of response head",
        )
        .into())
    }

    /// Reads and parses the status line and header section, consuming it
    /// from `reader`.
    pub async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Self> {
        let (len, head) = Self::peek(reader).await?;
        reader.discard(len);
        Ok(head)
    }

    /// Serializes the head: status line with the original reason phrase,
    /// headers in original order and casing, blank line.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(
            format!(
                "{:?} {} {}\r\n",
                self.version,
                self.status.as_u16(),
                self.reason()
            )
            .as_bytes(),
        );
        self.headers.encode_into(&mut buf);
        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Writes the serialized head to `writer`.
    pub async fn write(&self, writer: &mut (impl AsyncWrite + Send + Unpin)) -> io::Result<()> {
        writer.write_all(&self.encode()).await
    }
}
