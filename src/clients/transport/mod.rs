//! Concrete transports: the final element of every send chain.

mod http;
mod noop;
mod otlp;
mod stdout;

use std::sync::Arc;

use async_trait::async_trait;

pub use http::HttpTransport;
pub use noop::NoopTransport;
pub use otlp::OtlpTransport;
pub use stdout::StdoutTransport;

use crate::config::{TransportConfig, TransportKind};
use crate::entry::Entry;
use crate::error::{BuildError, TransportError};

/// A single network sender.
///
/// `send` attempts one delivery of the whole batch and classifies failures
/// as retriable (transient network conditions, 5xx, 429) or fatal
/// (malformed payloads, other 4xx).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempts one delivery of `entries`.
    async fn send(&self, entries: &[Entry]) -> Result<(), TransportError>;

    /// Identifier used as a metric label.
    fn endpoint(&self) -> &str;
}

/// Builds the transport selected by the configured URL scheme.
pub fn build(config: &TransportConfig, url: &str) -> Result<Arc<dyn Transport>, BuildError> {
    match TransportKind::from_scheme_of(url) {
        TransportKind::HttpJson => Ok(Arc::new(HttpTransport::new(config, url)?)),
        TransportKind::OtlpGrpc => Ok(Arc::new(OtlpTransport::new(config, url)?)),
        TransportKind::Stdout => Ok(Arc::new(StdoutTransport::new(url))),
        TransportKind::Noop => Ok(Arc::new(NoopTransport::new(url))),
    }
}

impl TransportKind {
    /// Like the config-time classification, with `noop` as the fallback for
    /// endpoint strings produced from prefix/suffix concatenation.
    pub(crate) fn from_scheme_of(url: &str) -> TransportKind {
        match url.split("://").next() {
            Some("http") | Some("https") => TransportKind::HttpJson,
            Some("grpc") | Some("grpcs") => TransportKind::OtlpGrpc,
            Some("stdout") => TransportKind::Stdout,
            _ => TransportKind::Noop,
        }
    }
}
