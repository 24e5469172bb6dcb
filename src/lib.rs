pub mod client;
pub mod config;
pub mod config_validation;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod proxy;
pub mod relay;
pub mod session;
pub mod stream;
pub mod tls;
pub mod tunnel;
pub mod uri;

pub use client::ClientSession;
pub use config::Config;
pub use error::ProxyError;
pub use message::{BodyFraming, MessageHead, Parser, RequestHead, ResponseHead, Serializer};
pub use proxy::{Proxy, ProxySettings};
pub use relay::RelayEngine;
pub use session::{ReadStatus, Session, SessionOptions};
pub use stream::{DuplexStream, HandshakeRole};
pub use tls::TlsContext;
