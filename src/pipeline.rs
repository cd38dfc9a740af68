//! Pipeline facade: owns the runtime, the seed chain, the registry, and the
//! router, and exposes the two entry points the host adapter needs.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clients::buffered::{BatchSettings, BufferedClient};
use crate::clients::memory::MemoryClient;
use crate::clients::registry::{ClientFactory, Registry, TenantEventSource};
use crate::clients::retry::RetryConfig;
use crate::clients::tenant::TenantClient;
use crate::clients::throttle::Throttler;
use crate::clients::transport;
use crate::clients::LogClient;
use crate::config::Config;
use crate::error::{BuildError, RouterError, RuntimeSnafu};
use crate::event::RawRecord;
use crate::internal_events::GARDEN_HOST;
use crate::router::Router;

pub struct Pipeline {
    router: Router,
    seed: Arc<dyn LogClient>,
    registry: Option<Arc<Registry>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    // Kept alive for the lifetime of the pipeline; all chain workers run on
    // it. Dropped last.
    _runtime: tokio::runtime::Runtime,
}

impl Pipeline {
    /// Builds the full pipeline from a resolved configuration.
    ///
    /// The registry is only constructed when dynamic routing is configured
    /// and an event source is provided; otherwise every record flows to the
    /// seed chain.
    pub fn new(
        config: Config,
        event_source: Option<&dyn TenantEventSource>,
    ) -> Result<Pipeline, BuildError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .thread_name("logshuttle-worker")
            .build()
            .context(RuntimeSnafu)?;
        let handle = runtime.handle().clone();
        let cancel = CancellationToken::new();

        let seed = build_chain(
            &config,
            &config.transport.url,
            GARDEN_HOST,
            &config.buffer.queue_name,
            handle.clone(),
            &cancel,
        )?;

        let registry = match (config.dynamic_routing_enabled(), event_source) {
            (true, Some(source)) => {
                let factory = tenant_client_factory(
                    config.clone(),
                    Arc::clone(&seed),
                    handle.clone(),
                    cancel.clone(),
                );
                Some(Registry::start(
                    factory,
                    source,
                    config.controller.sync_timeout,
                    handle,
                )?)
            }
            _ => None,
        };

        let router = Router::new(&config, Arc::clone(&seed), registry.clone());
        info!(
            message = "Pipeline ready.",
            endpoint = %config.transport.url,
            dynamic_routing = registry.is_some(),
        );

        Ok(Pipeline {
            router,
            seed,
            registry,
            cancel,
            closed: AtomicBool::new(false),
            _runtime: runtime,
        })
    }

    /// Routes one record; never blocks on network I/O.
    pub fn send_record(&self, record: RawRecord) -> Result<(), RouterError> {
        self.router.send_record(record)
    }

    /// Shuts the pipeline down: cancels all background work, drains the
    /// seed chain, then stops the registry (draining each tenant chain).
    ///
    /// Idempotent; later calls return immediately.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(message = "Closing pipeline.");
        self.cancel.cancel();
        self.seed.stop_wait();
        if let Some(registry) = &self.registry {
            registry.stop();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}

/// Composes one send chain: transport, buffering, optional throttle.
fn build_chain(
    config: &Config,
    url: &str,
    host: &str,
    queue_name: &str,
    runtime: tokio::runtime::Handle,
    cancel: &CancellationToken,
) -> Result<Arc<dyn LogClient>, BuildError> {
    let transport = transport::build(&config.transport, url)?;
    let batch = BatchSettings {
        wait: config.buffer.batch_wait,
        size: config.buffer.batch_size,
    };
    let retry = RetryConfig {
        min_backoff: config.transport.min_backoff,
        max_backoff: config.transport.max_backoff,
        max_retries: config.transport.max_retries,
    };

    let inner: Arc<dyn LogClient> = if config.buffer.enabled {
        let queue_config =
            logshuttle_queue::QueueConfig::from_path(config.buffer.queue_dir.join(queue_name))
                .max_segment_records(config.buffer.queue_segment_size)
                .capacity_records(config.buffer.queue_capacity)
                .sync(config.buffer.queue_sync)
                .overflow(config.buffer.queue_overflow)
                .build();
        Arc::new(BufferedClient::new(
            transport,
            host,
            queue_config,
            batch,
            retry,
            runtime,
            cancel,
        )?)
    } else {
        Arc::new(MemoryClient::new(
            transport, host, batch, retry, runtime, cancel,
        ))
    };

    if config.transport.throttle_enabled {
        let rate = NonZeroU32::new(config.transport.throttle_requests_per_sec)
            .expect("validated during config resolution");
        Ok(Arc::new(Throttler::new(inner, rate)))
    } else {
        Ok(inner)
    }
}

/// The factory the registry uses to build a client for a new tenant.
///
/// Each tenant gets its own queue directory and its own chain against the
/// endpoint derived from prefix + tenant + suffix; the seed handle is the
/// shared seed chain.
fn tenant_client_factory(
    config: Config,
    seed: Arc<dyn LogClient>,
    runtime: tokio::runtime::Handle,
    cancel: CancellationToken,
) -> ClientFactory {
    Box::new(move |descriptor, state| {
        let url = config.tenant_url(&descriptor.name);
        let queue_name = format!("{}-{}", config.buffer.queue_name, descriptor.name);
        let shoot = build_chain(
            &config,
            &url,
            &descriptor.name,
            &queue_name,
            runtime.clone(),
            &cancel,
        )?;
        Ok(TenantClient::new(
            descriptor.name.clone(),
            shoot,
            Arc::clone(&seed),
            config.policy,
            state,
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::clients::registry::{InMemoryEventSource, TenantResource};
    use crate::event::RawValue;

    fn config_with(dir: &TempDir, extra: &[(&str, &str)]) -> Config {
        let mut pairs: HashMap<String, String> = HashMap::from([
            ("URL".to_owned(), "noop://seed".to_owned()),
            (
                "QueueDir".to_owned(),
                dir.path().to_string_lossy().into_owned(),
            ),
        ]);
        for (k, v) in extra {
            pairs.insert(k.to_string(), v.to_string());
        }
        Config::resolve(&pairs).unwrap()
    }

    fn record(namespace: &str) -> RawRecord {
        RawRecord {
            timestamp: Utc::now(),
            fields: vec![
                (
                    RawValue::string("kubernetes"),
                    RawValue::Map(vec![(
                        RawValue::string("namespace_name"),
                        RawValue::string(namespace),
                    )]),
                ),
                (RawValue::string("log"), RawValue::string("hello")),
            ],
        }
    }

    #[test]
    fn pipeline_without_dynamic_routing_has_no_registry() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(config_with(&dir, &[]), None).unwrap();
        assert!(pipeline.registry.is_none());

        pipeline.send_record(record("kube-system")).unwrap();
        pipeline.close();
    }

    #[test]
    fn dynamic_routing_builds_tenant_clients_from_events() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryEventSource::new();
        source.upsert(TenantResource {
            name: "shoot--dev--a".to_owned(),
            raw: serde_json::json!({
                "metadata": {"name": "shoot--dev--a"},
                "status": {"lastOperation": {"type": "Reconcile", "state": "Succeeded"}},
            })
            .to_string()
            .into_bytes(),
        });

        let config = config_with(
            &dir,
            &[
                ("DynamicHostPath", "kubernetes.namespace_name"),
                ("DynamicHostPrefix", "noop://"),
                ("DynamicHostSuffix", ".svc"),
            ],
        );
        let pipeline = Pipeline::new(config, Some(&source)).unwrap();
        let registry = pipeline.registry.as_ref().unwrap();
        assert_eq!(registry.len(), 1);

        pipeline.send_record(record("shoot--dev--a")).unwrap();
        pipeline.send_record(record("kube-system")).unwrap();
        pipeline.close();
    }

    #[test]
    fn close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(config_with(&dir, &[]), None).unwrap();
        pipeline.close();
        pipeline.close();
    }
}
