//! Minimal HTTP/1.1 request parsing, routing and responses.
//!
//! The proxy answers exactly one request per connection and always closes
//! it, so only the request line matters. Headers are read (to find the end
//! of the request) and otherwise ignored.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use th_core::ChannelId;

/// Largest accepted request head.
pub const MAX_HEADER_BYTES: usize = 8192;

pub const CONTENT_TYPE_PLAYLIST: &str = "application/vnd.apple.mpegurl";
pub const CONTENT_TYPE_SEGMENT: &str = "video/MP2T";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
}

/// Read a request head up to the blank line and parse its request line.
///
/// Fails with `InvalidData` for oversized or malformed requests and
/// `UnexpectedEof` if the peer closes first.
pub async fn read_request<R>(reader: &mut R) -> io::Result<Request>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of headers",
            ));
        }
        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_header_end(&buf[scan_from..]) {
            buf.truncate(scan_from + end);
            break;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "headers too large"));
        }
    }

    if buf.len() > MAX_HEADER_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "headers too large"));
    }

    parse_request_head(&buf)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse `METHOD SP target SP HTTP/1.x` from a request head.
pub fn parse_request_head(head: &[u8]) -> io::Result<Request> {
    let head = std::str::from_utf8(head)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 headers"))?;

    let request_line = head
        .lines()
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty request"))?;

    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request line"));
    };

    if method.is_empty()
        || !method.bytes().all(|b| b.is_ascii_uppercase())
        || !target.starts_with('/')
        || !version.starts_with("HTTP/1.")
    {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request line"));
    }

    let path = target.split('?').next().unwrap_or(target);

    Ok(Request {
        method: method.to_owned(),
        path: path.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Health,
    Playlist(ChannelId),
    Segment(ChannelId, String),
    NotFound,
}

/// Map a request path to a route. Unparseable ids are not found.
pub fn route(path: &str) -> Route {
    if path == "/" || path == "/health" {
        return Route::Health;
    }

    if let Some(rest) = path.strip_prefix("/channel/") {
        return match rest.strip_suffix(".m3u8").map(ChannelId::parse) {
            Some(Ok(id)) => Route::Playlist(id),
            _ => Route::NotFound,
        };
    }

    if let Some(rest) = path.strip_prefix("/segment/") {
        let Some((id, file)) = rest.split_once('/') else {
            return Route::NotFound;
        };
        if !file.ends_with(".ts") || file.contains('/') {
            return Route::NotFound;
        }
        return match ChannelId::parse(id) {
            Ok(id) => Route::Segment(id, file.to_owned()),
            Err(_) => Route::NotFound,
        };
    }

    Route::NotFound
}

/// Path a client uses to fetch one of `channel`'s segments.
pub fn segment_url(channel: &ChannelId, file: &str) -> String {
    format!("/segment/{channel}/{file}")
}

/// Rewrite the bare segment names of an on-disk playlist into proxy paths.
///
/// Players resolve URIs against the playlist URL, so `segment00001.ts` under
/// `/channel/{id}.m3u8` would land on `/channel/segment00001.ts`.
pub fn rewrite_playlist(body: &[u8], channel: &ChannelId) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 256);
    for line in body.split_inclusive(|&b| b == b'\n') {
        let is_uri = !line.starts_with(b"#") && !line.iter().all(u8::is_ascii_whitespace);
        if is_uri && !line.starts_with(b"/") {
            out.extend_from_slice(segment_url(channel, "").as_bytes());
        }
        out.extend_from_slice(line);
    }
    out
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    /// Plain-text response whose body is the reason phrase.
    pub fn status(status: u16) -> Self {
        Self::new(status, CONTENT_TYPE_TEXT, reason_phrase(status))
    }

    pub fn ok_text(body: &str) -> Self {
        Self::new(200, CONTENT_TYPE_TEXT, body)
    }

    pub fn playlist(body: Vec<u8>) -> Self {
        Self::new(200, CONTENT_TYPE_PLAYLIST, body)
    }

    pub fn segment(body: Vec<u8>) -> Self {
        Self::new(200, CONTENT_TYPE_SEGMENT, body)
    }

    /// Status line and headers, including the terminating blank line.
    pub fn head(&self) -> String {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n",
            self.status,
            reason_phrase(self.status),
            self.content_type,
            self.body.len(),
        );
        if self.status == 405 {
            head.push_str("Allow: GET\r\n");
        }
        if self.content_type == CONTENT_TYPE_PLAYLIST {
            head.push_str("Cache-Control: no-cache\r\n");
        }
        head.push_str("\r\n");
        head
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(self.head().as_bytes()).await?;
        writer.write_all(&self.body).await?;
        writer.flush().await
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
