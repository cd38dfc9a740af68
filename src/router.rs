//! The hot path: normalization, metadata fallback, label shaping, tenant-key
//! extraction, client selection, line building, dispatch.

use std::sync::Arc;

use tracing::trace;

use crate::clients::registry::{GetOutcome, Registry};
use crate::clients::{HandleOutcome, LogClient};
use crate::config::{Config, DynamicTenantConfig, LabelConfig, MetadataConfig, RoutingConfig};
use crate::entry::{render_line, Entry, Labels};
use crate::error::{ForwardError, RouterError};
use crate::event::{field_at, normalize, Fields, RawRecord, Value};
use crate::internal_events::{
    drop_reason, DroppedLogs, ForwardedLogs, IncomingLog, MetadataMissing, GARDEN_HOST,
};

/// Label injected by the dynamic-tenant rule.
const TENANT_ID_LABEL: &str = "__tenant_id__";

/// Kubernetes metadata keys populated by the tag fallback.
const KUBERNETES_KEY: &str = "kubernetes";

pub struct Router {
    labels: LabelConfig,
    metadata: MetadataConfig,
    routing: RoutingConfig,
    dynamic_tenant: Option<DynamicTenantConfig>,
    hostname_label: Option<(String, String)>,
    seed: Arc<dyn LogClient>,
    registry: Option<Arc<Registry>>,
}

enum Selected {
    Tenant(Arc<crate::clients::tenant::TenantClient>),
    Seed,
}

impl Router {
    pub fn new(
        config: &Config,
        seed: Arc<dyn LogClient>,
        registry: Option<Arc<Registry>>,
    ) -> Self {
        let hostname_label = config.labels.hostname_key.clone().map(|key| {
            let value = config
                .labels
                .hostname_value
                .clone()
                .or_else(|| {
                    hostname::get()
                        .ok()
                        .and_then(|name| name.into_string().ok())
                })
                .unwrap_or_default();
            (key, value)
        });
        Router {
            labels: config.labels.clone(),
            metadata: config.metadata.clone(),
            routing: config.routing.clone(),
            dynamic_tenant: config.dynamic_tenant.clone(),
            hostname_label,
            seed,
            registry,
        }
    }

    /// Routes one record. Never blocks on network I/O.
    pub fn send_record(&self, raw: RawRecord) -> Result<(), RouterError> {
        let mut record = normalize(raw);

        // Recover Kubernetes metadata from the tag when the collector did
        // not attach any.
        if !record.fields.contains_key(KUBERNETES_KEY) && self.metadata.fallback_to_tag {
            match self.metadata_from_tag(&record.fields) {
                Some(kubernetes) => {
                    record
                        .fields
                        .insert(KUBERNETES_KEY.to_owned(), Value::Map(kubernetes));
                }
                None => {
                    MetadataMissing {
                        dropped: self.metadata.drop_without_metadata,
                    }
                    .emit();
                    if self.metadata.drop_without_metadata {
                        return Ok(());
                    }
                }
            }
        }

        let mut labels = self.build_labels(&record.fields);

        let tenant_key = self.extract_tenant_key(&record.fields);
        let host = tenant_key.as_deref().unwrap_or(GARDEN_HOST);

        let mut dynamic_tenant_applied = false;
        if let Some(dynamic) = &self.dynamic_tenant {
            if let Some(value) = record.fields.get(&dynamic.field) {
                let rendered = value.to_string();
                if dynamic.regex.is_match(&rendered) {
                    labels.insert(TENANT_ID_LABEL, dynamic.tenant.clone());
                    dynamic_tenant_applied = true;
                }
            }
        }

        IncomingLog { host }.emit();

        // Scrub label sources and configured noise from the payload.
        for key in self.labels.label_keys.iter().chain(&self.labels.remove_keys) {
            record.fields.remove(key);
        }
        if record.fields.is_empty() {
            DroppedLogs {
                host,
                reason: drop_reason::EMPTY_RECORD,
                count: 1,
            }
            .emit();
            return Ok(());
        }

        let selected = match (&tenant_key, &self.registry) {
            (Some(key), Some(registry)) => match registry.get(key) {
                GetOutcome::Found(client) => Selected::Tenant(client),
                GetOutcome::Stopped => {
                    DroppedLogs {
                        host,
                        reason: drop_reason::REGISTRY_STOPPED,
                        count: 1,
                    }
                    .emit();
                    return Ok(());
                }
                GetOutcome::NotFound => {
                    DroppedLogs {
                        host,
                        reason: drop_reason::TENANT_NOT_FOUND,
                        count: 1,
                    }
                    .emit();
                    return Ok(());
                }
            },
            _ => Selected::Seed,
        };

        if matches!(selected, Selected::Seed)
            && dynamic_tenant_applied
            && self
                .dynamic_tenant
                .as_ref()
                .is_some_and(|d| d.remove_tenant_id_for_default_url)
        {
            labels.remove(TENANT_ID_LABEL);
        }

        let line = if self.labels.drop_single_key && record.fields.len() == 1 {
            record
                .fields
                .values()
                .next()
                .map(Value::to_string)
                .unwrap_or_default()
        } else {
            render_line(&record.fields, self.labels.line_format)
        };
        let entry = Entry {
            labels,
            timestamp: record.timestamp,
            line,
        };
        trace!(message = "Dispatching record.", host = %host);

        let result = match &selected {
            Selected::Tenant(client) => client.handle(entry),
            Selected::Seed => self.seed.handle(entry),
        };
        match result {
            Ok(HandleOutcome::Accepted) => {
                ForwardedLogs { host, count: 1 }.emit();
                Ok(())
            }
            // The chain counted the discard itself.
            Ok(HandleOutcome::Discarded) => Ok(()),
            Err(ForwardError::Throttled) => Err(RouterError::RecordThrottled),
            Err(ForwardError::QueueFull { .. }) => {
                DroppedLogs {
                    host,
                    reason: drop_reason::QUEUE_FULL,
                    count: 1,
                }
                .emit();
                Err(RouterError::RecordRejected)
            }
            Err(ForwardError::Enqueue { .. }) | Err(ForwardError::ChainStopped) => {
                DroppedLogs {
                    host,
                    reason: drop_reason::ENQUEUE_FAILED,
                    count: 1,
                }
                .emit();
                Ok(())
            }
        }
    }

    /// Parses the collector tag into a Kubernetes metadata map.
    fn metadata_from_tag(&self, fields: &Fields) -> Option<Fields> {
        let tag = fields.get(&self.metadata.tag_key)?.as_str()?;
        let trimmed = tag
            .strip_prefix(&self.metadata.tag_prefix)
            .unwrap_or(tag);
        let captures = self.metadata.tag_expression.captures(trimmed)?;

        let mut kubernetes = Fields::new();
        for (group, key) in [
            ("pod_name", "pod_name"),
            ("namespace_name", "namespace_name"),
            ("container_name", "container_name"),
            ("container_id", "docker_id"),
        ] {
            if let Some(value) = captures.name(group) {
                kubernetes.insert(key.to_owned(), Value::Text(value.as_str().to_owned()));
            }
        }
        if kubernetes.is_empty() {
            return None;
        }
        Some(kubernetes)
    }

    fn build_labels(&self, fields: &Fields) -> Labels {
        // The capacity hint pre-sizes the staging buffer; validation happens
        // on insertion into the label set.
        let mut staged: Vec<(String, String)> =
            Vec::with_capacity(self.labels.label_set_init_capacity);

        if self.labels.auto_kubernetes_labels {
            if let Some(kubernetes) = fields.get(KUBERNETES_KEY).and_then(Value::as_map) {
                flatten_kubernetes(kubernetes, &mut staged);
            }
        } else if let Some(label_map) = &self.labels.label_map {
            stage_label_map(fields, label_map, &mut staged);
        } else {
            for key in &self.labels.label_keys {
                if let Some(value) = fields.get(key) {
                    staged.push((key.clone(), value.to_string()));
                }
            }
        }

        for key in &self.labels.preserved_labels {
            if let Some(value) = fields.get(key) {
                staged.push((key.clone(), value.to_string()));
            }
        }
        if let Some((key, value)) = &self.hostname_label {
            staged.push((key.clone(), value.clone()));
        }

        staged.into_iter().collect()
    }

    fn extract_tenant_key(&self, fields: &Fields) -> Option<String> {
        let path = self.routing.dynamic_host_path.as_ref()?;
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();
        let value = field_at(fields, &segments)?;
        let candidate = match value {
            Value::Text(text) => text.clone(),
            other if other.is_scalar() => other.to_string(),
            _ => return None,
        };
        if self.routing.dynamic_host_regex.is_match(&candidate) {
            Some(candidate)
        } else {
            None
        }
    }
}

/// Flattens the `kubernetes` metadata map into staged labels: scalar fields
/// by sanitized name, the nested `labels` map entry by entry, with `pod_id`
/// and `annotations` skipped.
fn flatten_kubernetes(kubernetes: &Fields, staged: &mut Vec<(String, String)>) {
    for (key, value) in kubernetes {
        match key.as_str() {
            "pod_id" | "annotations" => {}
            "labels" => {
                if let Some(inner) = value.as_map() {
                    for (name, label_value) in inner {
                        staged.push((
                            crate::entry::sanitize_label_name(name),
                            label_value.to_string(),
                        ));
                    }
                }
            }
            _ if value.is_scalar() => {
                staged.push((crate::entry::sanitize_label_name(key), value.to_string()));
            }
            _ => {}
        }
    }
}

/// Applies the recursive rename tree: a string leaf names the label a field
/// maps to, an object recurses into the matching nested map.
fn stage_label_map(
    fields: &Fields,
    label_map: &serde_json::Value,
    staged: &mut Vec<(String, String)>,
) {
    let Some(object) = label_map.as_object() else {
        return;
    };
    for (key, target) in object {
        let Some(value) = fields.get(key) else { continue };
        match target {
            serde_json::Value::String(label_name) => {
                staged.push((label_name.clone(), value.to_string()));
            }
            serde_json::Value::Object(_) => {
                if let Some(nested) = value.as_map() {
                    stage_label_map(nested, target, staged);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::config::Config;
    use crate::event::RawValue;

    #[derive(Default)]
    struct CapturingClient {
        entries: Mutex<Vec<Entry>>,
        handled: AtomicUsize,
    }

    impl LogClient for CapturingClient {
        fn handle(&self, entry: Entry) -> Result<HandleOutcome, ForwardError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().unwrap().push(entry);
            Ok(HandleOutcome::Accepted)
        }
        fn endpoint(&self) -> &str {
            "capturing"
        }
        fn stop(&self) {}
        fn stop_wait(&self) {}
    }

    fn config(pairs: &[(&str, &str)]) -> Config {
        let lookup: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::resolve(&lookup).unwrap()
    }

    fn kubernetes_record(namespace: &str, log: &str) -> RawRecord {
        RawRecord {
            timestamp: Utc::now(),
            fields: vec![
                (
                    RawValue::string("kubernetes"),
                    RawValue::Map(vec![
                        (
                            RawValue::string("namespace_name"),
                            RawValue::string(namespace),
                        ),
                        (RawValue::string("pod_name"), RawValue::string("p")),
                        (RawValue::string("container_name"), RawValue::string("c")),
                    ]),
                ),
                (RawValue::string("log"), RawValue::string(log)),
            ],
        }
    }

    #[test]
    fn garden_records_reach_the_seed_client() {
        let seed = Arc::new(CapturingClient::default());
        let config = config(&[("DynamicHostPath", "kubernetes.namespace_name")]);
        let router = Router::new(&config, Arc::clone(&seed) as Arc<dyn LogClient>, None);

        router
            .send_record(kubernetes_record("kube-system", "infra line"))
            .unwrap();

        assert_eq!(seed.handled.load(Ordering::SeqCst), 1);
        let entries = seed.entries.lock().unwrap();
        // Default key scrubbing leaves only `log`, and the single remaining
        // key renders bare.
        assert_eq!(entries[0].line, "infra line");
    }

    #[test]
    fn tag_fallback_populates_kubernetes_metadata() {
        let seed = Arc::new(CapturingClient::default());
        let config = config(&[
            ("FallbackToTagWhenMetadataIsMissing", "true"),
            ("LabelKeys", "job"),
            ("RemoveKeys", "tag"),
            ("DropSingleKey", "false"),
            ("LineFormat", "json"),
        ]);
        let router = Router::new(&config, Arc::clone(&seed) as Arc<dyn LogClient>, None);

        let container_id = "a".repeat(64);
        let raw = RawRecord {
            timestamp: Utc::now(),
            fields: vec![
                (
                    RawValue::string("tag"),
                    RawValue::string(format!("kube.p_ns_c-{container_id}.log")),
                ),
                (RawValue::string("log"), RawValue::string("hello")),
            ],
        };
        router.send_record(raw).unwrap();

        let entries = seed.entries.lock().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&entries[0].line).unwrap();
        assert_eq!(parsed["kubernetes"]["pod_name"], "p");
        assert_eq!(parsed["kubernetes"]["namespace_name"], "ns");
        assert_eq!(parsed["kubernetes"]["container_name"], "c");
    }

    #[test]
    fn unparseable_tag_drops_when_configured() {
        let seed = Arc::new(CapturingClient::default());
        let config = config(&[
            ("FallbackToTagWhenMetadataIsMissing", "true"),
            ("DropLogEntryWithoutK8sMetadata", "true"),
        ]);
        let router = Router::new(&config, Arc::clone(&seed) as Arc<dyn LogClient>, None);

        let raw = RawRecord {
            timestamp: Utc::now(),
            fields: vec![
                (RawValue::string("tag"), RawValue::string("invalid")),
                (RawValue::string("log"), RawValue::string("hello")),
            ],
        };
        router.send_record(raw).unwrap();

        assert_eq!(seed.handled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn label_keys_become_labels_and_are_scrubbed() {
        let seed = Arc::new(CapturingClient::default());
        let config = config(&[
            ("LabelKeys", "job,severity"),
            ("RemoveKeys", ""),
            ("DropSingleKey", "false"),
        ]);
        let router = Router::new(&config, Arc::clone(&seed) as Arc<dyn LogClient>, None);

        let raw = RawRecord {
            timestamp: Utc::now(),
            fields: vec![
                (RawValue::string("job"), RawValue::string("collector")),
                (RawValue::string("severity"), RawValue::string("info")),
                (RawValue::string("log"), RawValue::string("hello")),
            ],
        };
        router.send_record(raw).unwrap();

        let entries = seed.entries.lock().unwrap();
        assert_eq!(entries[0].labels.get("job"), Some("collector"));
        assert_eq!(entries[0].labels.get("severity"), Some("info"));
        let parsed: serde_json::Value = serde_json::from_str(&entries[0].line).unwrap();
        assert!(parsed.get("job").is_none());
        assert!(parsed.get("severity").is_none());
    }

    #[test]
    fn auto_kubernetes_labels_flatten_and_sanitize() {
        let seed = Arc::new(CapturingClient::default());
        let config = config(&[
            ("AutoKubernetesLabels", "true"),
            ("DropSingleKey", "false"),
        ]);
        let router = Router::new(&config, Arc::clone(&seed) as Arc<dyn LogClient>, None);

        let raw = RawRecord {
            timestamp: Utc::now(),
            fields: vec![
                (
                    RawValue::string("kubernetes"),
                    RawValue::Map(vec![
                        (RawValue::string("pod_name"), RawValue::string("p")),
                        (RawValue::string("pod_id"), RawValue::string("skipped")),
                        (
                            RawValue::string("labels"),
                            RawValue::Map(vec![(
                                RawValue::string("app.kubernetes.io/name"),
                                RawValue::string("api"),
                            )]),
                        ),
                    ]),
                ),
                (RawValue::string("log"), RawValue::string("hello")),
            ],
        };
        router.send_record(raw).unwrap();

        let entries = seed.entries.lock().unwrap();
        assert_eq!(entries[0].labels.get("pod_name"), Some("p"));
        assert_eq!(entries[0].labels.get("app_kubernetes_io_name"), Some("api"));
        assert_eq!(entries[0].labels.get("pod_id"), None);
    }

    #[test]
    fn label_map_renames_nested_fields() {
        let seed = Arc::new(CapturingClient::default());
        let config = config(&[
            (
                "LabelMap",
                r#"{"kubernetes": {"namespace_name": "namespace"}, "stream": "stream"}"#,
            ),
            ("DropSingleKey", "false"),
        ]);
        let router = Router::new(&config, Arc::clone(&seed) as Arc<dyn LogClient>, None);

        let mut raw = kubernetes_record("ns-a", "hello");
        raw.fields
            .push((RawValue::string("stream"), RawValue::string("stderr")));
        router.send_record(raw).unwrap();

        let entries = seed.entries.lock().unwrap();
        assert_eq!(entries[0].labels.get("namespace"), Some("ns-a"));
        assert_eq!(entries[0].labels.get("stream"), Some("stderr"));
    }

    #[test]
    fn scrubbing_every_field_counts_a_drop() {
        let seed = Arc::new(CapturingClient::default());
        let config = config(&[("RemoveKeys", "log")]);
        let router = Router::new(&config, Arc::clone(&seed) as Arc<dyn LogClient>, None);

        let raw = RawRecord {
            timestamp: Utc::now(),
            fields: vec![(RawValue::string("log"), RawValue::string("hello"))],
        };
        router.send_record(raw).unwrap();

        assert_eq!(seed.handled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dynamic_tenant_label_is_applied_and_stripped_for_seed() {
        let seed = Arc::new(CapturingClient::default());
        let config = config(&[
            ("DynamicTenant.Tenant", "operator"),
            ("DynamicTenant.Field", "origin"),
            ("DynamicTenant.Regex", "^seed-"),
            ("DynamicTenant.RemoveTenantIdWhenSendingToDefaultURL", "true"),
            ("DropSingleKey", "false"),
        ]);
        let router = Router::new(&config, Arc::clone(&seed) as Arc<dyn LogClient>, None);

        let raw = RawRecord {
            timestamp: Utc::now(),
            fields: vec![
                (RawValue::string("origin"), RawValue::string("seed-system")),
                (RawValue::string("log"), RawValue::string("hello")),
            ],
        };
        router.send_record(raw).unwrap();

        let entries = seed.entries.lock().unwrap();
        // Applied, then stripped again on the seed route.
        assert_eq!(entries[0].labels.get(TENANT_ID_LABEL), None);
    }

    #[test]
    fn throttled_chain_surfaces_a_retry_signal() {
        struct ThrottledClient;
        impl LogClient for ThrottledClient {
            fn handle(&self, _entry: Entry) -> Result<HandleOutcome, ForwardError> {
                Err(ForwardError::Throttled)
            }
            fn endpoint(&self) -> &str {
                "throttled"
            }
            fn stop(&self) {}
            fn stop_wait(&self) {}
        }

        let config = config(&[]);
        let router = Router::new(&config, Arc::new(ThrottledClient) as Arc<dyn LogClient>, None);
        let raw = RawRecord {
            timestamp: Utc::now(),
            fields: vec![(RawValue::string("log"), RawValue::string("hello"))],
        };
        assert!(matches!(
            router.send_record(raw),
            Err(RouterError::RecordThrottled)
        ));
    }
}
