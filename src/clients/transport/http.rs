//! JSON push over HTTP.
//!
//! Entries are grouped into streams by label set and pushed as one request
//! per batch. Response classification: 429 and 5xx are retriable, any other
//! non-success status is fatal.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use super::Transport;
use crate::config::TransportConfig;
use crate::entry::Entry;
use crate::error::{BuildError, TransportError};

const TENANT_HEADER: &str = "X-Scope-OrgID";

pub struct HttpTransport {
    endpoint: String,
    tenant_id: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: Vec<Stream<'a>>,
}

#[derive(Serialize)]
struct Stream<'a> {
    stream: BTreeMap<&'a str, &'a str>,
    values: Vec<[String; 2]>,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig, url: &str) -> Result<Self, BuildError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);

        if config.tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca_path) = &config.tls.ca_path {
            let pem = std::fs::read(ca_path).map_err(|e| BuildError::TransportBuild {
                endpoint: url.to_owned(),
                reason: format!("reading CA bundle {}: {e}", ca_path.display()),
            })?;
            let cert =
                reqwest::Certificate::from_pem(&pem).map_err(|e| BuildError::TransportBuild {
                    endpoint: url.to_owned(),
                    reason: format!("parsing CA bundle: {e}"),
                })?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert_path), Some(key_path)) = (&config.tls.cert_path, &config.tls.key_path) {
            let mut pem = std::fs::read(cert_path).map_err(|e| BuildError::TransportBuild {
                endpoint: url.to_owned(),
                reason: format!("reading client certificate {}: {e}", cert_path.display()),
            })?;
            let key = std::fs::read(key_path).map_err(|e| BuildError::TransportBuild {
                endpoint: url.to_owned(),
                reason: format!("reading client key {}: {e}", key_path.display()),
            })?;
            pem.extend_from_slice(&key);
            let identity =
                reqwest::Identity::from_pem(&pem).map_err(|e| BuildError::TransportBuild {
                    endpoint: url.to_owned(),
                    reason: format!("assembling client identity: {e}"),
                })?;
            builder = builder.identity(identity);
        }

        let client = builder.build().map_err(|e| BuildError::TransportBuild {
            endpoint: url.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(HttpTransport {
            endpoint: url.to_owned(),
            tenant_id: config.tenant_id.clone(),
            client,
        })
    }

    fn build_body(entries: &[Entry]) -> PushRequest<'_> {
        // Entries sharing a label set collapse into one stream, values in
        // batch order.
        let mut streams: Vec<(BTreeMap<&str, &str>, Vec<[String; 2]>)> = Vec::new();
        for entry in entries {
            let labels: BTreeMap<&str, &str> = entry.labels.iter().collect();
            let value = [
                entry
                    .timestamp
                    .timestamp_nanos_opt()
                    .unwrap_or_default()
                    .to_string(),
                entry.line.clone(),
            ];
            match streams.iter_mut().find(|(l, _)| *l == labels) {
                Some((_, values)) => values.push(value),
                None => streams.push((labels, vec![value])),
            }
        }
        PushRequest {
            streams: streams
                .into_iter()
                .map(|(stream, values)| Stream { stream, values })
                .collect(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, entries: &[Entry]) -> Result<(), TransportError> {
        let body = Self::build_body(entries);
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(tenant) = &self.tenant_id {
            request = request.header(TENANT_HEADER, tenant);
        }

        let response = request.send().await.map_err(|e| TransportError::Retriable {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = format!("server responded with {status}");
        if status.as_u16() == 429 || status.is_server_error() {
            Err(TransportError::Retriable {
                endpoint: self.endpoint.clone(),
                reason,
            })
        } else {
            Err(TransportError::Fatal {
                endpoint: self.endpoint.clone(),
                reason,
            })
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
