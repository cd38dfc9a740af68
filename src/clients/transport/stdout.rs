//! A transport that prints entries to standard output.

use std::io::Write;

use async_trait::async_trait;
use serde::Serialize;

use super::Transport;
use crate::entry::{Entry, Labels};
use crate::error::TransportError;

pub struct StdoutTransport {
    endpoint: String,
}

#[derive(Serialize)]
struct StdoutLine<'a> {
    labels: &'a Labels,
    timestamp: i64,
    line: &'a str,
}

impl StdoutTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        StdoutTransport {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn send(&self, entries: &[Entry]) -> Result<(), TransportError> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for entry in entries {
            let rendered = serde_json::to_string(&StdoutLine {
                labels: &entry.labels,
                timestamp: entry.timestamp.timestamp_nanos_opt().unwrap_or_default(),
                line: &entry.line,
            })
            .map_err(|e| TransportError::Fatal {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;
            writeln!(out, "{rendered}").map_err(|e| TransportError::Retriable {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
