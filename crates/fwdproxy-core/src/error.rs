use thiserror::Error;

/// Errors produced by the proxy.
///
/// Only [`ProxyError::Bind`] and [`ProxyError::Config`] are fatal to a run;
/// everything else is contained within the connection that produced it.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bind failed: {0}")]
    Bind(String),

    #[error("accept setup failed: {0}")]
    AcceptSetup(String),

    #[error("request parse failed: {0}")]
    Parse(String),

    #[error("request head exceeds {0} bytes")]
    RequestTooLarge(usize),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("resolution failed: {0}")]
    Resolve(String),

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<httparse::Error> for ProxyError {
    fn from(e: httparse::Error) -> Self {
        ProxyError::Parse(e.to_string())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
