use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Resolve error for {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("TLS handshake error: {0}")]
    Handshake(String),

    #[error("HTTP parse error: {0}")]
    Parse(String),

    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout(_))
    }

    /// Short stable label, used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Resolve { .. } => "resolve",
            ProxyError::Connect(_) => "connect",
            ProxyError::Handshake(_) => "handshake",
            ProxyError::Parse(_) => "parse",
            ProxyError::Transport(_) => "transport",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::TlsConfig(_) => "tls_config",
            ProxyError::Config(_) => "config",
            ProxyError::Io(_) => "io",
        }
    }

    pub(crate) fn transport(err: io::Error) -> Self {
        ProxyError::Transport(err)
    }

    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        ProxyError::Parse(msg.into())
    }
}
