//! The CONNECT handshake response.

use crate::request::HttpVersion;
use std::fmt;

/// Identity reported in the `Proxy-agent` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAgent {
    pub name: String,
    pub version: String,
}

impl ProxyAgent {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ProxyAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Build the response sent to a CONNECT client once the upstream connection
/// is up. The status line echoes the client's declared HTTP version.
pub fn connection_established(version: HttpVersion, agent: &ProxyAgent) -> Vec<u8> {
    format!(
        "HTTP/{}.{} 200 Connection established\r\nProxy-agent: {}\r\n\r\n",
        version.major, version.minor, agent
    )
    .into_bytes()
}
