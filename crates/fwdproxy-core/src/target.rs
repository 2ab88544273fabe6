//! Upstream target extraction from a request target string.

use crate::error::{ProxyError, ProxyResult};
use crate::request::Method;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Port assumed for absolute-form `http://` targets without an explicit port.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// `<text>:<digits>`, the authority form used by CONNECT.
fn authority_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*):(\d+)$").expect("Invalid authority regex"))
}

/// `http://<authority>[/path]`, the absolute form forward requests use.
fn absolute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^http://([^/?#]+)(?:[/?#].*)?$").expect("Invalid absolute-form regex")
    })
}

/// Host and port the proxy should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Work out where a request should be sent.
///
/// Every method accepts the `host:port` authority form. Methods other than
/// CONNECT also accept an absolute `http://host[:port]/...` URL, with the
/// port defaulting to [`DEFAULT_HTTP_PORT`]. Origin-form targets such as
/// `/index.html` carry no destination and are rejected.
///
/// # Errors
///
/// Returns [`ProxyError::InvalidTarget`] if no form matches or the port does
/// not fit in a `u16`.
pub fn extract_target(method: Method, target: &str) -> ProxyResult<Target> {
    if !method.is_tunnel() {
        if let Some(caps) = absolute_regex().captures(target) {
            let authority = &caps[1];
            return match authority_regex().captures(authority) {
                Some(hp) => build(&hp[1], &hp[2], target),
                None => Ok(Target {
                    host: authority.to_string(),
                    port: DEFAULT_HTTP_PORT,
                }),
            };
        }
    }

    match authority_regex().captures(target) {
        Some(caps) => build(&caps[1], &caps[2], target),
        None => Err(ProxyError::InvalidTarget(target.to_string())),
    }
}

fn build(host: &str, port: &str, target: &str) -> ProxyResult<Target> {
    let port = port
        .parse::<u16>()
        .map_err(|_| ProxyError::InvalidTarget(target.to_string()))?;
    Ok(Target {
        host: host.to_string(),
        port,
    })
}
