//! OTLP logs over gRPC.

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_client::LogsServiceClient;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use tonic::codec::CompressionEncoding;
use tonic::metadata::{MetadataKey, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig};

use super::Transport;
use crate::config::TransportConfig;
use crate::entry::Entry;
use crate::error::{BuildError, TransportError};

pub struct OtlpTransport {
    endpoint: String,
    client: LogsServiceClient<Channel>,
    headers: Vec<(MetadataKey<tonic::metadata::Ascii>, MetadataValue<tonic::metadata::Ascii>)>,
    timeout: std::time::Duration,
}

impl OtlpTransport {
    pub fn new(config: &TransportConfig, url: &str) -> Result<Self, BuildError> {
        // tonic speaks http(s); the grpc(s) scheme only selects the
        // transport kind.
        let dial_url = url
            .replacen("grpcs://", "https://", 1)
            .replacen("grpc://", "http://", 1);

        let mut endpoint_builder = Channel::from_shared(dial_url.clone())
            .map_err(|e| BuildError::TransportBuild {
                endpoint: url.to_owned(),
                reason: e.to_string(),
            })?
            .timeout(config.timeout);

        if dial_url.starts_with("https://") {
            let mut tls = ClientTlsConfig::new();
            if let Some(server_name) = &config.tls.server_name {
                tls = tls.domain_name(server_name.clone());
            }
            if let Some(ca_path) = &config.tls.ca_path {
                let pem = std::fs::read(ca_path).map_err(|e| BuildError::TransportBuild {
                    endpoint: url.to_owned(),
                    reason: format!("reading CA bundle {}: {e}", ca_path.display()),
                })?;
                tls = tls.ca_certificate(tonic::transport::Certificate::from_pem(pem));
            }
            if let (Some(cert_path), Some(key_path)) =
                (&config.tls.cert_path, &config.tls.key_path)
            {
                let cert = std::fs::read(cert_path).map_err(|e| BuildError::TransportBuild {
                    endpoint: url.to_owned(),
                    reason: format!("reading client certificate {}: {e}", cert_path.display()),
                })?;
                let key = std::fs::read(key_path).map_err(|e| BuildError::TransportBuild {
                    endpoint: url.to_owned(),
                    reason: format!("reading client key {}: {e}", key_path.display()),
                })?;
                tls = tls.identity(tonic::transport::Identity::from_pem(cert, key));
            }
            endpoint_builder =
                endpoint_builder
                    .tls_config(tls)
                    .map_err(|e| BuildError::TransportBuild {
                        endpoint: url.to_owned(),
                        reason: e.to_string(),
                    })?;
        }

        let channel = endpoint_builder.connect_lazy();
        let mut client = LogsServiceClient::new(channel);
        if config.compression_gzip {
            client = client.send_compressed(CompressionEncoding::Gzip);
        }

        let mut headers = Vec::with_capacity(config.otlp_headers.len() + 1);
        for (name, value) in &config.otlp_headers {
            let key = name.to_ascii_lowercase().parse::<MetadataKey<_>>().map_err(|e| {
                BuildError::TransportBuild {
                    endpoint: url.to_owned(),
                    reason: format!("invalid header name `{name}`: {e}"),
                }
            })?;
            let value = value.parse().map_err(|e| BuildError::TransportBuild {
                endpoint: url.to_owned(),
                reason: format!("invalid header value for `{name}`: {e}"),
            })?;
            headers.push((key, value));
        }
        if let Some(tenant) = &config.tenant_id {
            let value = tenant.parse().map_err(|e| BuildError::TransportBuild {
                endpoint: url.to_owned(),
                reason: format!("invalid tenant id: {e}"),
            })?;
            headers.push(("x-scope-orgid".parse().expect("static header name"), value));
        }

        Ok(OtlpTransport {
            endpoint: url.to_owned(),
            client,
            headers,
            timeout: config.timeout,
        })
    }

    fn build_request(&self, entries: &[Entry]) -> tonic::Request<ExportLogsServiceRequest> {
        let log_records = entries
            .iter()
            .map(|entry| LogRecord {
                time_unix_nano: entry.timestamp.timestamp_nanos_opt().unwrap_or_default() as u64,
                body: Some(AnyValue {
                    value: Some(any_value::Value::StringValue(entry.line.clone())),
                }),
                attributes: entry
                    .labels
                    .iter()
                    .map(|(name, value)| KeyValue {
                        key: name.to_owned(),
                        value: Some(AnyValue {
                            value: Some(any_value::Value::StringValue(value.to_owned())),
                        }),
                    })
                    .collect(),
                ..Default::default()
            })
            .collect();

        let mut request = tonic::Request::new(ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                scope_logs: vec![ScopeLogs {
                    log_records,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        });
        for (key, value) in &self.headers {
            request.metadata_mut().insert(key.clone(), value.clone());
        }
        request
    }

    fn classify(&self, status: tonic::Status) -> TransportError {
        use tonic::Code;
        let reason = status.to_string();
        match status.code() {
            Code::Unavailable
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Aborted
            | Code::Internal
            | Code::Unknown => TransportError::Retriable {
                endpoint: self.endpoint.clone(),
                reason,
            },
            _ => TransportError::Fatal {
                endpoint: self.endpoint.clone(),
                reason,
            },
        }
    }
}

#[async_trait]
impl Transport for OtlpTransport {
    async fn send(&self, entries: &[Entry]) -> Result<(), TransportError> {
        let request = self.build_request(entries);
        let mut client = self.client.clone();
        match tokio::time::timeout(self.timeout, client.export(request)).await {
            Ok(Ok(_response)) => Ok(()),
            Ok(Err(status)) => Err(self.classify(status)),
            Err(_elapsed) => Err(TransportError::Retriable {
                endpoint: self.endpoint.clone(),
                reason: format!("request exceeded {:?}", self.timeout),
            }),
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
