//! Host adapter.
//!
//! The host process drives the plugin through four entry points: register,
//! init, flush, exit. The ABI shim marshals flush payloads into
//! [`RawRecord`]s before they reach this module, so the core never touches
//! the host's value representation.

use std::sync::Once;

use tracing::{error, info};

use crate::clients::registry::TenantEventSource;
use crate::config::{Config, ConfigLookup, METRICS_PORT};
use crate::error::{BuildError, RouterError};
use crate::event::RawRecord;
use crate::pipeline::Pipeline;

/// Name the ABI shim reports to the host at registration.
pub const PLUGIN_NAME: &str = "logshuttle";

/// Description the ABI shim reports to the host at registration.
pub const PLUGIN_DESCRIPTION: &str = "Multi-tenant log forwarding output";

/// Result of one flush invocation, mirroring the host's contract.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    /// Every record was accepted (or counted as an intentional drop).
    Ok,
    /// The chain is throttled; the host should replay the chunk.
    Retry,
    /// A record was lost to a full queue; the host should report the flush
    /// as failed.
    Error,
}

static TELEMETRY_INIT: Once = Once::new();

/// One plugin instance, bound to a pipeline.
pub struct HostPlugin {
    pipeline: Pipeline,
}

impl HostPlugin {
    /// Initializes telemetry, resolves configuration, and builds the
    /// pipeline. Any error here aborts plugin startup.
    pub fn init(
        lookup: &dyn ConfigLookup,
        event_source: Option<&dyn TenantEventSource>,
    ) -> Result<HostPlugin, BuildError> {
        let config = Config::resolve(lookup)?;
        init_telemetry(&config);

        let pipeline = Pipeline::new(config, event_source)?;
        info!(message = "Plugin initialized.");
        Ok(HostPlugin { pipeline })
    }

    /// Forwards one flush chunk record by record.
    ///
    /// A throttled record stops the chunk with `Retry` so the host replays
    /// it; a record refused by a full queue stops the chunk with `Error`.
    /// Everything else is already persisted or counted, so the host need
    /// not retry.
    pub fn flush(&self, records: impl IntoIterator<Item = RawRecord>) -> FlushOutcome {
        for record in records {
            match self.pipeline.send_record(record) {
                Ok(()) => {}
                Err(RouterError::RecordThrottled) => return FlushOutcome::Retry,
                Err(RouterError::RecordRejected) => return FlushOutcome::Error,
            }
        }
        FlushOutcome::Ok
    }

    /// Shuts the pipeline down; idempotent.
    pub fn exit(&self) {
        self.pipeline.close();
    }
}

fn init_telemetry(config: &Config) {
    TELEMETRY_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_new(&config.diagnostics.log_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .finish();
        // The host may already have installed a subscriber; keep its choice.
        let _ = tracing::subscriber::set_global_default(subscriber);

        let exporter = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], METRICS_PORT))
            .install();
        if let Err(err) = exporter {
            error!(
                message = "Failed to install the Prometheus scrape endpoint.",
                error = %err,
                port = METRICS_PORT,
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::event::RawValue;

    fn record(line: &str) -> RawRecord {
        RawRecord {
            timestamp: Utc::now(),
            fields: vec![(RawValue::string("log"), RawValue::string(line))],
        }
    }

    #[test]
    fn flush_returns_ok_for_accepted_records() {
        let dir = TempDir::new().unwrap();
        let lookup: HashMap<String, String> = HashMap::from([
            ("URL".to_owned(), "noop://seed".to_owned()),
            (
                "QueueDir".to_owned(),
                dir.path().to_string_lossy().into_owned(),
            ),
        ]);
        let plugin = HostPlugin::init(&lookup, None).unwrap();

        let outcome = plugin.flush(vec![record("a"), record("b")]);
        assert_eq!(outcome, FlushOutcome::Ok);
        plugin.exit();
    }

    #[test]
    fn invalid_config_aborts_startup() {
        let lookup: HashMap<String, String> =
            HashMap::from([("URL".to_owned(), "gopher://nope".to_owned())]);
        assert!(matches!(
            HostPlugin::init(&lookup, None),
            Err(BuildError::ConfigInvalid { .. })
        ));
    }
}
