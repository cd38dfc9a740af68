//! Configuration surface.
//!
//! Every key is read through [`ConfigLookup`], the abstraction over the
//! host's per-instance key/value store. Unknown values are fatal at `Init`;
//! the pipeline never starts on a half-valid configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use snafu::ensure;

use crate::entry::LineFormat;
use crate::error::{BuildError, ConfigInvalidSnafu};
use crate::tenant::{ClientPolicy, TargetPolicy};

/// Default expression recovering Kubernetes metadata from a collector tag.
pub const DEFAULT_TAG_EXPRESSION: &str = r"\.?(?P<pod_name>[^_]+)_(?P<namespace_name>[^_]+)_(?P<container_name>.+)-(?P<container_id>[a-z0-9]{64})\.log$";

/// Default pattern separating tenant namespaces from infrastructure ones.
pub const DEFAULT_DYNAMIC_HOST_REGEX: &str = "^shoot-";

/// Fixed port the Prometheus scrape endpoint binds.
pub const METRICS_PORT: u16 = 2021;

/// Key/value lookup against the host's configuration context.
pub trait ConfigLookup {
    /// Returns the raw value for `key`, if the host has one.
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigLookup for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Which concrete transport a URL selects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    /// OTLP over gRPC (`grpc://` / `grpcs://`).
    OtlpGrpc,
    /// JSON push over HTTP (`http://` / `https://`).
    HttpJson,
    /// Writes entries to standard output (`stdout://`).
    Stdout,
    /// Discards entries, counting them as drops (`noop://`).
    Noop,
}

impl TransportKind {
    fn from_url(url: &str) -> Option<TransportKind> {
        let scheme = url.split("://").next()?;
        match scheme {
            "http" | "https" => Some(TransportKind::HttpJson),
            "grpc" | "grpcs" => Some(TransportKind::OtlpGrpc),
            "stdout" => Some(TransportKind::Stdout),
            "noop" => Some(TransportKind::Noop),
            _ => None,
        }
    }
}

/// TLS material for the HTTP and gRPC transports.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub server_name: Option<String>,
    pub insecure_skip_verify: bool,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
}

/// Settings of one outbound transport plus its send chain.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Backend endpoint; the scheme selects the transport kind.
    pub url: String,
    /// Tenant header attached to every request, when non-empty.
    pub tenant_id: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// First retry delay.
    pub min_backoff: Duration,
    /// Retry delay ceiling.
    pub max_backoff: Duration,
    /// Delivery attempts before a batch is parked for the next cycle.
    pub max_retries: usize,
    /// TLS material.
    pub tls: TlsConfig,
    /// Extra headers for the OTLP transport, from `OtlpHeaders`.
    pub otlp_headers: Vec<(String, String)>,
    /// Whether OTLP requests are gzip-compressed.
    pub compression_gzip: bool,
    /// Whether the throttle decorator is installed.
    pub throttle_enabled: bool,
    /// Token-bucket refill rate.
    pub throttle_requests_per_sec: u32,
}

impl TransportConfig {
    /// The transport kind the URL selects.
    pub fn kind(&self) -> TransportKind {
        // Validated during parsing.
        TransportKind::from_url(&self.url).unwrap_or(TransportKind::Noop)
    }
}

/// On-disk buffering settings.
#[derive(Clone, Debug)]
pub struct BufferConfig {
    /// Whether the durable queue is used at all; without it records flow
    /// through a bounded in-memory channel.
    pub enabled: bool,
    /// Durable queue implementation selector; the segmented queue serves
    /// both accepted spellings.
    pub buffer_type: String,
    /// Root directory of all queues.
    pub queue_dir: PathBuf,
    /// Records per segment file.
    pub queue_segment_size: usize,
    /// Total queued-record capacity.
    pub queue_capacity: usize,
    /// fsync policy.
    pub queue_sync: logshuttle_queue::SyncPolicy,
    /// Overflow policy.
    pub queue_overflow: logshuttle_queue::OverflowPolicy,
    /// Directory name of the seed queue; tenant queues append the tenant key.
    pub queue_name: String,
    /// Maximum time a batch waits for more entries.
    pub batch_wait: Duration,
    /// Batch payload budget, in bytes.
    pub batch_size: usize,
}

/// Tenant-key extraction and endpoint derivation.
#[derive(Clone, Debug)]
pub struct RoutingConfig {
    /// Path into the field tree yielding the tenant-key candidate.
    pub dynamic_host_path: Option<Vec<String>>,
    /// Pattern a candidate must match to be a tenant key.
    pub dynamic_host_regex: Regex,
    /// Endpoint prefix for tenant backends.
    pub dynamic_host_prefix: String,
    /// Endpoint suffix for tenant backends.
    pub dynamic_host_suffix: String,
}

/// Label shaping of outgoing entries.
#[derive(Clone, Debug)]
pub struct LabelConfig {
    /// Top-level fields copied into labels.
    pub label_keys: Vec<String>,
    /// Recursive field-to-label renaming tree.
    pub label_map: Option<serde_json::Value>,
    /// Fields deleted from the record after label extraction.
    pub remove_keys: Vec<String>,
    /// Whether `kubernetes.labels` is flattened into labels.
    pub auto_kubernetes_labels: bool,
    /// Line rendering format.
    pub line_format: LineFormat,
    /// Render a lone remaining field as a bare value line.
    pub drop_single_key: bool,
    /// Pre-sizing hint for label sets.
    pub label_set_init_capacity: usize,
    /// Label name carrying the emitting node's hostname.
    pub hostname_key: Option<String>,
    /// Literal overriding the detected hostname.
    pub hostname_value: Option<String>,
    /// Fields copied into labels before key scrubbing.
    pub preserved_labels: Vec<String>,
}

/// Fallback extraction of Kubernetes metadata from the collector tag.
#[derive(Clone, Debug)]
pub struct MetadataConfig {
    /// Whether the fallback runs when `kubernetes` is absent.
    pub fallback_to_tag: bool,
    /// Field holding the tag.
    pub tag_key: String,
    /// Prefix stripped from the tag before matching.
    pub tag_prefix: String,
    /// Expression with `pod_name`, `namespace_name`, `container_name` and
    /// `container_id` capture groups.
    pub tag_expression: Regex,
    /// Whether records without recoverable metadata are dropped.
    pub drop_without_metadata: bool,
}

/// Optional tenant-id labeling driven by a record field.
#[derive(Clone, Debug)]
pub struct DynamicTenantConfig {
    /// Value of the injected `__tenant_id__` label.
    pub tenant: String,
    /// Field inspected for a match.
    pub field: String,
    /// Pattern the field value must match.
    pub regex: Regex,
    /// Whether the label is stripped again from records routed to the seed.
    pub remove_tenant_id_for_default_url: bool,
}

/// Controller settings.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// How long construction waits for the event source's initial sync.
    pub sync_timeout: Duration,
    /// Parsed for compatibility; the reconciler's delete path supersedes the
    /// expiry sweeper these governed.
    pub deleted_client_time_expiration: Duration,
    /// Parsed for compatibility, see above.
    pub clean_expired_clients_period: Duration,
}

/// Diagnostics settings.
#[derive(Clone, Debug)]
pub struct DiagnosticsConfig {
    /// Log level filter for the subscriber.
    pub log_level: String,
    /// Parsed for compatibility; profiling endpoints belong to the host
    /// process.
    pub pprof: bool,
}

/// The fully parsed plugin configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub routing: RoutingConfig,
    pub labels: LabelConfig,
    pub metadata: MetadataConfig,
    pub dynamic_tenant: Option<DynamicTenantConfig>,
    pub buffer: BufferConfig,
    pub transport: TransportConfig,
    pub policy: ClientPolicy,
    pub controller: ControllerConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl Config {
    /// Reads and validates the full configuration surface.
    pub fn resolve(lookup: &dyn ConfigLookup) -> Result<Config, BuildError> {
        let url = lookup
            .get("URL")
            .unwrap_or_else(|| "http://localhost:3100/api/prom/push".to_owned());
        ensure!(
            TransportKind::from_url(&url).is_some(),
            ConfigInvalidSnafu {
                key: "URL",
                reason: format!("unsupported scheme in `{url}`"),
            }
        );

        let transport = TransportConfig {
            url,
            tenant_id: lookup.get("TenantID").filter(|t| !t.is_empty()),
            timeout: parse_duration(lookup, "Timeout", Duration::from_secs(10))?,
            min_backoff: parse_duration(lookup, "MinBackoff", Duration::from_millis(500))?,
            max_backoff: parse_duration(lookup, "MaxBackoff", Duration::from_secs(300))?,
            max_retries: parse_usize(lookup, "MaxRetries", 10)?,
            tls: TlsConfig {
                cert_path: lookup.get("TlsCertPath").map(PathBuf::from),
                key_path: lookup.get("TlsKeyPath").map(PathBuf::from),
                ca_path: lookup.get("TlsCAPath").map(PathBuf::from),
                server_name: lookup.get("TlsServerName"),
                insecure_skip_verify: parse_bool(lookup, "TlsInsecureSkipVerify", false)?,
                min_version: lookup.get("TlsMinVersion"),
                max_version: lookup.get("TlsMaxVersion"),
            },
            otlp_headers: parse_header_list(lookup, "OtlpHeaders")?,
            compression_gzip: match lookup.get("OtlpCompression").as_deref() {
                None | Some("none") => false,
                Some("gzip") => true,
                Some(other) => {
                    return ConfigInvalidSnafu {
                        key: "OtlpCompression",
                        reason: format!("expected `none` or `gzip`, got `{other}`"),
                    }
                    .fail()
                }
            },
            throttle_enabled: parse_bool(lookup, "ThrottleEnabled", false)?,
            throttle_requests_per_sec: parse_usize(lookup, "ThrottleRequestsPerSec", 10)? as u32,
        };
        ensure!(
            !transport.throttle_enabled || transport.throttle_requests_per_sec > 0,
            ConfigInvalidSnafu {
                key: "ThrottleRequestsPerSec",
                reason: "must be positive when throttling is enabled",
            }
        );

        let buffer = BufferConfig {
            enabled: parse_bool(lookup, "Buffer", true)?,
            buffer_type: match lookup.get("BufferType") {
                None => "dque".to_owned(),
                Some(kind) if kind == "dque" || kind == "pdque" => kind,
                Some(other) => {
                    return ConfigInvalidSnafu {
                        key: "BufferType",
                        reason: format!("expected `dque` or `pdque`, got `{other}`"),
                    }
                    .fail()
                }
            },
            queue_dir: PathBuf::from(
                lookup
                    .get("QueueDir")
                    .unwrap_or_else(|| "/tmp/logshuttle-buffer".to_owned()),
            ),
            queue_segment_size: parse_usize(lookup, "QueueSegmentSize", 500)?,
            queue_capacity: parse_usize(lookup, "QueueCapacity", 50_000)?,
            queue_sync: match lookup.get("QueueSync").as_deref() {
                Some("always") | Some("full") => logshuttle_queue::SyncPolicy::Always,
                None | Some("batched") | Some("normal") => logshuttle_queue::SyncPolicy::Batched,
                Some("never") => logshuttle_queue::SyncPolicy::Never,
                Some(other) => {
                    return ConfigInvalidSnafu {
                        key: "QueueSync",
                        reason: format!("expected `always`, `batched` or `never`, got `{other}`"),
                    }
                    .fail()
                }
            },
            queue_overflow: match lookup.get("QueueOverflow").as_deref() {
                None | Some("reject") => logshuttle_queue::OverflowPolicy::Reject,
                Some("drop-oldest") => logshuttle_queue::OverflowPolicy::DropOldest,
                Some("block") => logshuttle_queue::OverflowPolicy::BlockWithTimeout(
                    parse_duration(lookup, "QueueBlockTimeout", Duration::from_secs(1))?,
                ),
                Some(other) => {
                    return ConfigInvalidSnafu {
                        key: "QueueOverflow",
                        reason: format!(
                            "expected `reject`, `drop-oldest` or `block`, got `{other}`"
                        ),
                    }
                    .fail()
                }
            },
            queue_name: lookup.get("QueueName").unwrap_or_else(|| "dque".to_owned()),
            batch_wait: parse_duration(lookup, "BatchWait", Duration::from_secs(1))?,
            batch_size: parse_usize(lookup, "BatchSize", 102_400)?,
        };
        ensure!(
            buffer.queue_segment_size > 0,
            ConfigInvalidSnafu {
                key: "QueueSegmentSize",
                reason: "must be positive",
            }
        );

        let routing = RoutingConfig {
            dynamic_host_path: lookup
                .get("DynamicHostPath")
                .map(|raw| parse_host_path(&raw))
                .transpose()?,
            dynamic_host_regex: parse_regex(
                lookup,
                "DynamicHostRegex",
                DEFAULT_DYNAMIC_HOST_REGEX,
            )?,
            dynamic_host_prefix: lookup.get("DynamicHostPrefix").unwrap_or_default(),
            dynamic_host_suffix: lookup.get("DynamicHostSuffix").unwrap_or_default(),
        };

        let labels = LabelConfig {
            label_keys: parse_list(lookup, "LabelKeys"),
            label_map: lookup
                .get("LabelMap")
                .map(|raw| {
                    serde_json::from_str(&raw).map_err(|e| {
                        ConfigInvalidSnafu {
                            key: "LabelMap",
                            reason: format!("invalid JSON: {e}"),
                        }
                        .build()
                    })
                })
                .transpose()?,
            remove_keys: match lookup.get("RemoveKeys") {
                Some(raw) => split_list(&raw),
                None => vec![
                    "kubernetes".to_owned(),
                    "stream".to_owned(),
                    "time".to_owned(),
                    "tag".to_owned(),
                ],
            },
            auto_kubernetes_labels: parse_bool(lookup, "AutoKubernetesLabels", false)?,
            line_format: match lookup.get("LineFormat").as_deref() {
                None | Some("json") => LineFormat::Json,
                Some("kvpair") => LineFormat::KvPair,
                Some(other) => {
                    return ConfigInvalidSnafu {
                        key: "LineFormat",
                        reason: format!("expected `json` or `kvpair`, got `{other}`"),
                    }
                    .fail()
                }
            },
            drop_single_key: parse_bool(lookup, "DropSingleKey", true)?,
            label_set_init_capacity: parse_usize(lookup, "LabelSetInitCapacity", 12)?,
            hostname_key: lookup.get("HostnameKey").filter(|k| !k.is_empty()),
            hostname_value: lookup.get("HostnameValue").filter(|v| !v.is_empty()),
            preserved_labels: parse_list(lookup, "PreservedLabels"),
        };

        let metadata = MetadataConfig {
            fallback_to_tag: parse_bool(lookup, "FallbackToTagWhenMetadataIsMissing", false)?,
            tag_key: lookup.get("TagKey").unwrap_or_else(|| "tag".to_owned()),
            tag_prefix: lookup.get("TagPrefix").unwrap_or_else(|| "kube".to_owned()),
            tag_expression: parse_regex(lookup, "TagExpression", DEFAULT_TAG_EXPRESSION)?,
            drop_without_metadata: parse_bool(lookup, "DropLogEntryWithoutK8sMetadata", false)?,
        };
        for group in ["pod_name", "namespace_name", "container_name"] {
            ensure!(
                metadata
                    .tag_expression
                    .capture_names()
                    .any(|name| name == Some(group)),
                ConfigInvalidSnafu {
                    key: "TagExpression",
                    reason: format!("missing capture group `{group}`"),
                }
            );
        }

        let dynamic_tenant = match (
            lookup.get("DynamicTenant.Tenant"),
            lookup.get("DynamicTenant.Field"),
        ) {
            (Some(tenant), Some(field)) if !tenant.is_empty() && !field.is_empty() => {
                Some(DynamicTenantConfig {
                    tenant,
                    field,
                    regex: parse_regex(lookup, "DynamicTenant.Regex", ".*")?,
                    remove_tenant_id_for_default_url: parse_bool(
                        lookup,
                        "DynamicTenant.RemoveTenantIdWhenSendingToDefaultURL",
                        false,
                    )?,
                })
            }
            _ => None,
        };

        let policy = ClientPolicy {
            shoot: parse_target_policy(lookup, "Shoot", ClientPolicy::default().shoot)?,
            seed: parse_target_policy(lookup, "Seed", ClientPolicy::default().seed)?,
        };

        let controller = ControllerConfig {
            sync_timeout: parse_duration(lookup, "CtlSyncTimeout", Duration::from_secs(60))?,
            deleted_client_time_expiration: parse_duration(
                lookup,
                "DeletedClientTimeExpiration",
                Duration::from_secs(3600),
            )?,
            clean_expired_clients_period: parse_duration(
                lookup,
                "CleanExpiredClientsPeriod",
                Duration::from_secs(24 * 3600),
            )?,
        };

        let diagnostics = DiagnosticsConfig {
            log_level: lookup.get("LogLevel").unwrap_or_else(|| "info".to_owned()),
            pprof: parse_bool(lookup, "Pprof", false)?,
        };

        Ok(Config {
            routing,
            labels,
            metadata,
            dynamic_tenant,
            buffer,
            transport,
            policy,
            controller,
            diagnostics,
        })
    }

    /// Whether dynamic per-tenant routing is configured at all.
    pub fn dynamic_routing_enabled(&self) -> bool {
        self.routing.dynamic_host_path.is_some()
    }

    /// The endpoint for a tenant's dedicated backend.
    pub fn tenant_url(&self, tenant: &str) -> String {
        format!(
            "{}{}{}",
            self.routing.dynamic_host_prefix, tenant, self.routing.dynamic_host_suffix
        )
    }
}

fn parse_bool(lookup: &dyn ConfigLookup, key: &str, default: bool) -> Result<bool, BuildError> {
    match lookup.get(key).as_deref() {
        None | Some("") => Ok(default),
        Some("true") | Some("on") | Some("1") => Ok(true),
        Some("false") | Some("off") | Some("0") => Ok(false),
        Some(other) => ConfigInvalidSnafu {
            key,
            reason: format!("expected a boolean, got `{other}`"),
        }
        .fail(),
    }
}

fn parse_usize(lookup: &dyn ConfigLookup, key: &str, default: usize) -> Result<usize, BuildError> {
    match lookup.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ConfigInvalidSnafu {
                key,
                reason: format!("expected an integer, got `{raw}`"),
            }
            .build()
        }),
    }
}

fn parse_duration(
    lookup: &dyn ConfigLookup,
    key: &str,
    default: Duration,
) -> Result<Duration, BuildError> {
    match lookup.get(key) {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(raw.trim()).map_err(|e| {
            ConfigInvalidSnafu {
                key,
                reason: format!("invalid duration `{raw}`: {e}"),
            }
            .build()
        }),
    }
}

fn parse_regex(lookup: &dyn ConfigLookup, key: &str, default: &str) -> Result<Regex, BuildError> {
    let raw = lookup.get(key).unwrap_or_else(|| default.to_owned());
    Regex::new(&raw).map_err(|e| {
        ConfigInvalidSnafu {
            key,
            reason: format!("invalid pattern `{raw}`: {e}"),
        }
        .build()
    })
}

fn parse_list(lookup: &dyn ConfigLookup, key: &str) -> Vec<String> {
    lookup.get(key).map(|raw| split_list(&raw)).unwrap_or_default()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_header_list(
    lookup: &dyn ConfigLookup,
    key: &str,
) -> Result<Vec<(String, String)>, BuildError> {
    let Some(raw) = lookup.get(key) else {
        return Ok(Vec::new());
    };
    let mut headers = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|i| !i.is_empty()) {
        let Some((name, value)) = item.split_once('=') else {
            return ConfigInvalidSnafu {
                key,
                reason: format!("expected `name=value`, got `{item}`"),
            }
            .fail();
        };
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }
    Ok(headers)
}

/// Parses a dynamic-host path descriptor into path segments.
///
/// Accepts either a dotted path (`kubernetes.namespace_name`) or the nested
/// JSON object form (`{"kubernetes": {"namespace_name": true}}`); the JSON
/// form follows the first key at every level.
fn parse_host_path(raw: &str) -> Result<Vec<String>, BuildError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        let mut value: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| {
            ConfigInvalidSnafu {
                key: "DynamicHostPath",
                reason: format!("invalid JSON: {e}"),
            }
            .build()
        })?;
        let mut path = Vec::new();
        loop {
            match value {
                serde_json::Value::Object(map) => {
                    let Some((key, next)) = map.into_iter().next() else {
                        break;
                    };
                    path.push(key);
                    value = next;
                }
                _ => break,
            }
        }
        ensure!(
            !path.is_empty(),
            ConfigInvalidSnafu {
                key: "DynamicHostPath",
                reason: "path descriptor resolves to no keys",
            }
        );
        Ok(path)
    } else {
        let path: Vec<String> = trimmed
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        ensure!(
            !path.is_empty(),
            ConfigInvalidSnafu {
                key: "DynamicHostPath",
                reason: "path descriptor resolves to no keys",
            }
        );
        Ok(path)
    }
}

fn parse_target_policy(
    lookup: &dyn ConfigLookup,
    target: &str,
    default: TargetPolicy,
) -> Result<TargetPolicy, BuildError> {
    let flag = |state: &str, fallback: bool| {
        parse_bool(lookup, &format!("SendLogsTo{target}When{state}State"), fallback)
    };
    Ok(TargetPolicy {
        creation: flag("Creation", default.creation)?,
        ready: flag("Ready", default.ready)?,
        hibernating: flag("Hibernating", default.hibernating)?,
        hibernated: flag("Hibernated", default.hibernated)?,
        deletion: flag("Deletion", default.deletion)?,
        restore: flag("Restore", default.restore)?,
        migration: flag("Migration", default.migration)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_resolve() {
        let config = Config::resolve(&lookup(&[])).unwrap();
        assert_eq!(config.transport.kind(), TransportKind::HttpJson);
        assert_eq!(config.labels.line_format, LineFormat::Json);
        assert!(config.labels.drop_single_key);
        assert!(!config.dynamic_routing_enabled());
        assert_eq!(config.buffer.batch_size, 102_400);
    }

    #[test]
    fn invalid_boolean_is_fatal() {
        let err = Config::resolve(&lookup(&[("Buffer", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("Buffer"));
    }

    #[test]
    fn unknown_url_scheme_is_fatal() {
        let err = Config::resolve(&lookup(&[("URL", "ftp://example.com")])).unwrap_err();
        assert!(err.to_string().contains("URL"));
    }

    #[test]
    fn host_path_accepts_both_forms() {
        let dotted = Config::resolve(&lookup(&[("DynamicHostPath", "kubernetes.namespace_name")]))
            .unwrap();
        assert_eq!(
            dotted.routing.dynamic_host_path.as_deref(),
            Some(&["kubernetes".to_owned(), "namespace_name".to_owned()][..])
        );

        let nested = Config::resolve(&lookup(&[(
            "DynamicHostPath",
            r#"{"kubernetes": {"namespace_name": true}}"#,
        )]))
        .unwrap();
        assert_eq!(
            nested.routing.dynamic_host_path.as_deref(),
            Some(&["kubernetes".to_owned(), "namespace_name".to_owned()][..])
        );
    }

    #[test]
    fn policy_table_is_read_per_state() {
        let config = Config::resolve(&lookup(&[
            ("SendLogsToShootWhenHibernatedState", "true"),
            ("SendLogsToSeedWhenReadyState", "true"),
        ]))
        .unwrap();
        assert!(config.policy.shoot.hibernated);
        assert!(config.policy.seed.ready);
        // Untouched cells keep their defaults.
        assert!(config.policy.shoot.ready);
    }

    #[test]
    fn tag_expression_must_name_the_kubernetes_groups() {
        let err =
            Config::resolve(&lookup(&[("TagExpression", "(?P<pod_name>.+)")])).unwrap_err();
        assert!(err.to_string().contains("namespace_name"));
    }

    #[test]
    fn tenant_url_concatenates_prefix_and_suffix() {
        let config = Config::resolve(&lookup(&[
            ("DynamicHostPath", "kubernetes.namespace_name"),
            ("DynamicHostPrefix", "http://vali."),
            ("DynamicHostSuffix", ".svc:3100/push"),
        ]))
        .unwrap();
        assert_eq!(
            config.tenant_url("shoot--dev--a"),
            "http://vali.shoot--dev--a.svc:3100/push"
        );
    }

    #[test]
    fn throttle_rate_must_be_positive_when_enabled() {
        let err = Config::resolve(&lookup(&[
            ("ThrottleEnabled", "true"),
            ("ThrottleRequestsPerSec", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("ThrottleRequestsPerSec"));
    }

    #[test]
    fn otlp_headers_parse_as_pairs() {
        let config = Config::resolve(&lookup(&[(
            "OtlpHeaders",
            "authorization=Bearer abc, x-scope=tenant",
        )]))
        .unwrap();
        assert_eq!(
            config.transport.otlp_headers,
            vec![
                ("authorization".to_owned(), "Bearer abc".to_owned()),
                ("x-scope".to_owned(), "tenant".to_owned()),
            ]
        );
    }
}
