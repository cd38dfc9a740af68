//! A transport that discards everything.
//!
//! Used by tests and as the placeholder for tenant endpoints that resolve
//! to nothing routable. Discarded records are visible in the drop counter.

use async_trait::async_trait;

use super::Transport;
use crate::entry::Entry;
use crate::error::TransportError;
use crate::internal_events::{drop_reason, DroppedLogs};

pub struct NoopTransport {
    endpoint: String,
}

impl NoopTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        NoopTransport {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Transport for NoopTransport {
    async fn send(&self, entries: &[Entry]) -> Result<(), TransportError> {
        DroppedLogs {
            host: &self.endpoint,
            reason: drop_reason::NOOP,
            count: entries.len() as u64,
        }
        .emit();
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
