//! Request-head sniffing.
//!
//! The proxy only looks at the first request of a connection, and only far
//! enough to learn the method, the target and the HTTP version. Everything
//! after the head is treated as opaque bytes.

use crate::error::{ProxyError, ProxyResult};
use std::fmt;

/// Largest request head the proxy will buffer while waiting for it to
/// complete (8 KiB).
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Header slots handed to the parser. Heads with more headers fail to parse.
const MAX_HEADERS: usize = 64;

/// Request methods the proxy is willing to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Connect,
    Get,
    Put,
    Post,
    Head,
    Delete,
}

impl Method {
    /// All supported methods.
    pub const ALL: [Method; 6] = [
        Method::Connect,
        Method::Get,
        Method::Put,
        Method::Post,
        Method::Head,
        Method::Delete,
    ];

    /// Match a method token exactly (methods are case-sensitive).
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == token)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "CONNECT",
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
        }
    }

    /// `true` for `CONNECT`, the only method that opens an opaque tunnel.
    pub fn is_tunnel(&self) -> bool {
        matches!(self, Method::Connect)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP version declared on the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// The parts of the first request the proxy cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: Method,
    /// Raw request target (`host:port` for CONNECT, usually a URL otherwise).
    pub target: String,
    pub version: HttpVersion,
    /// Length of the head including the terminating blank line. Bytes past
    /// this offset belong to the body or the tunnelled stream.
    pub head_len: usize,
}

/// Try to parse a request head from `buf`.
///
/// Returns `Ok(None)` while the head is still incomplete and `buf` is below
/// [`MAX_REQUEST_HEAD`]; the caller should read more and retry with the
/// grown buffer.
///
/// # Errors
///
/// - [`ProxyError::Parse`] for malformed heads, including any version other
///   than HTTP/1.0 and HTTP/1.1.
/// - [`ProxyError::RequestTooLarge`] if the head is still incomplete at the
///   size limit.
/// - [`ProxyError::UnsupportedMethod`] if the head is complete but the method
///   is not in [`Method::ALL`].
pub fn parse_request(buf: &[u8]) -> ProxyResult<Option<ProxyRequest>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial if buf.len() >= MAX_REQUEST_HEAD => {
            return Err(ProxyError::RequestTooLarge(MAX_REQUEST_HEAD));
        }
        httparse::Status::Partial => return Ok(None),
    };

    let token = req
        .method
        .ok_or_else(|| ProxyError::Parse("missing method".to_string()))?;
    let method =
        Method::from_token(token).ok_or_else(|| ProxyError::UnsupportedMethod(token.to_string()))?;
    let target = req
        .path
        .ok_or_else(|| ProxyError::Parse("missing request target".to_string()))?;
    let minor = req
        .version
        .ok_or_else(|| ProxyError::Parse("missing HTTP version".to_string()))?;

    Ok(Some(ProxyRequest {
        method,
        target: target.to_string(),
        // httparse only accepts HTTP/1.0 and HTTP/1.1
        version: HttpVersion { major: 1, minor },
        head_len,
    }))
}
