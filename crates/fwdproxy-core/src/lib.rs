//! fwdproxy-core: protocol library for the forward proxy.
//!
//! Parses the first request head of a client connection, decides where the
//! connection should go, and builds the CONNECT handshake response. Holds no
//! sockets; the server crate drives the I/O.

pub mod error;
pub mod handshake;
pub mod request;
pub mod target;

// Re-export commonly used items at crate root.
pub use error::{ProxyError, ProxyResult};
pub use handshake::{connection_established, ProxyAgent};
pub use request::{parse_request, HttpVersion, Method, ProxyRequest, MAX_REQUEST_HEAD};
pub use target::{extract_target, Target, DEFAULT_HTTP_PORT};
