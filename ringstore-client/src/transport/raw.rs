//! Minimal blocking HTTP/1.1 GET over a plain TCP socket.
//!
//! Used by the descriptor read path: once the response head is parsed, the
//! socket itself is handed to a [`crate::bridge::Transfer`] so the body can
//! be spliced straight into the destination. Only `http://` endpoints are
//! supported; chunked responses are flagged so the caller can stream them
//! instead.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use ringstore_common::{ByteRange, Endpoint, StorageKey};

use super::TransportError;

const MAX_HEAD_LEN: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;
const MAX_HEADERS: usize = 128;

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    /// Header names are lowercased.
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    /// Chunked framing can't be handed to a transfer strategy as is.
    pub chunked: bool,
    /// Body bytes that arrived together with the head.
    pub buffered: Vec<u8>,
    pub socket: TcpStream,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body bytes still on the socket, when the length is known.
    pub fn remaining(&self) -> Option<u64> {
        self.content_length
            .map(|len| len.saturating_sub(self.buffered.len() as u64))
    }

    /// Best-effort error body from what has already arrived.
    pub fn error_text(&self) -> String {
        String::from_utf8_lossy(&self.buffered).trim().to_string()
    }
}

fn io_failure(err: io::Error, phase: &'static str) -> TransportError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout(phase),
        _ => TransportError::Io(format!("{phase}: {err}")),
    }
}

fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream, TransportError> {
    let addrs = endpoint
        .authority()
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect(format!("resolving {}: {e}", endpoint.authority())))?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(socket) => return Ok(socket),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => TransportError::Timeout("connecting"),
        Some(e) => TransportError::Connect(e.to_string()),
        None => TransportError::Connect(format!("no addresses for {}", endpoint.authority())),
    })
}

/// Send `GET {endpoint}/{key}` and read the response head.
///
/// Reads and writes on the returned socket time out after `proxy_timeout`,
/// which is the per-chunk stall limit for the body transfer.
pub fn get(
    endpoint: &Endpoint,
    key: &StorageKey,
    range: Option<&ByteRange>,
    connect_timeout: Duration,
    proxy_timeout: Duration,
) -> Result<RawResponse, TransportError> {
    let socket = connect(endpoint, connect_timeout)?;
    socket
        .set_read_timeout(Some(proxy_timeout))
        .and_then(|()| socket.set_write_timeout(Some(proxy_timeout)))
        .and_then(|()| socket.set_nodelay(true))
        .map_err(|e| TransportError::Io(e.to_string()))?;

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nAccept-Encoding: identity\r\nConnection: close\r\n",
        endpoint.object_path(key),
        endpoint.authority()
    );
    if let Some(range) = range {
        request.push_str(&format!("Range: {}\r\n", range.header_value()));
    }
    request.push_str("\r\n");
    (&socket)
        .write_all(request.as_bytes())
        .map_err(|e| io_failure(e, "sending request"))?;

    read_head(socket)
}

fn read_head(mut socket: TcpStream) -> Result<RawResponse, TransportError> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let head = loop {
        if let Some(head) = parse_head(&buf)? {
            break head;
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(TransportError::Io("response head too large".into()));
        }
        let n = match socket.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_failure(e, "waiting for response headers")),
        };
        if n == 0 {
            return Err(TransportError::Io("connection closed before response headers".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let mut response = RawResponse {
        status: head.status,
        headers: head.headers,
        content_length: None,
        chunked: false,
        buffered: buf.split_off(head.len),
        socket,
    };
    response.chunked = response
        .header("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    if response.chunked {
        return Ok(response);
    }
    response.content_length = match response.header("content-length") {
        Some(v) => Some(
            v.parse::<u64>()
                .map_err(|_| TransportError::Io(format!("invalid Content-Length: {v}")))?,
        ),
        None => None,
    };
    if let Some(len) = response.content_length {
        if response.buffered.len() as u64 > len {
            response.buffered.truncate(len as usize);
        }
    }
    Ok(response)
}

struct ParsedHead {
    len: usize,
    status: u16,
    headers: Vec<(String, String)>,
}

/// `Ok(None)` until the whole head has arrived.
fn parse_head(buf: &[u8]) -> Result<Option<ParsedHead>, TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(TransportError::Io(format!("malformed response head: {e}"))),
    };
    let status = response
        .code
        .ok_or_else(|| TransportError::Io("response head has no status code".into()))?;
    let headers = response
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();
    Ok(Some(ParsedHead { len, status, headers }))
}
