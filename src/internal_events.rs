//! Metric emission.
//!
//! Every observable event in the pipeline is a small struct with an
//! `emit(self)` method so call sites stay free of metric name strings and
//! the accounting invariant (each record increments exactly one of the
//! forwarded / dropped / without-metadata counters) is auditable in one
//! place.

use metrics::counter;
use tracing::{debug, error, warn};

/// Reserved host label for infrastructure traffic.
pub const GARDEN_HOST: &str = "garden";

/// Drop reason labels.
pub mod drop_reason {
    /// The registry was already stopped when the record arrived.
    pub const REGISTRY_STOPPED: &str = "registry_stopped";
    /// The extracted tenant key had no registered client.
    pub const TENANT_NOT_FOUND: &str = "tenant_not_found";
    /// The on-disk queue rejected the record.
    pub const QUEUE_FULL: &str = "queue_full";
    /// Key scrubbing removed every field.
    pub const EMPTY_RECORD: &str = "empty_record";
    /// Both targets of the tenant client are muted.
    pub const MUTED: &str = "muted";
    /// The no-op transport discarded the record.
    pub const NOOP: &str = "noop";
    /// The record was larger than a queue frame allows.
    pub const OVERSIZED: &str = "oversized";
    /// The record could not be placed onto the queue.
    pub const ENQUEUE_FAILED: &str = "enqueue_failed";
    /// The batch was abandoned after a fatal transport response.
    pub const TRANSPORT_FATAL: &str = "transport_fatal";
    /// The queue discarded old records to admit new ones.
    pub const QUEUE_OVERFLOW: &str = "queue_overflow";
}

/// A record entered the router and was attributed to a host.
pub struct IncomingLog<'a> {
    /// Tenant key or `garden`.
    pub host: &'a str,
}

impl IncomingLog<'_> {
    pub fn emit(self) {
        counter!("incoming_logs_total", "host" => self.host.to_owned()).increment(1);
    }
}

/// One or more records were handed to a send chain.
pub struct ForwardedLogs<'a> {
    /// Tenant key or `garden`.
    pub host: &'a str,
    /// Number of records forwarded.
    pub count: u64,
}

impl ForwardedLogs<'_> {
    pub fn emit(self) {
        counter!("forwarded_logs_total", "host" => self.host.to_owned()).increment(self.count);
    }
}

/// One or more records were discarded.
pub struct DroppedLogs<'a> {
    /// Tenant key or `garden`.
    pub host: &'a str,
    /// One of the [`drop_reason`] labels.
    pub reason: &'static str,
    /// Number of records dropped.
    pub count: u64,
}

impl DroppedLogs<'_> {
    pub fn emit(self) {
        debug!(
            message = "Records dropped.",
            host = %self.host,
            reason = %self.reason,
            count = self.count,
        );
        counter!(
            "dropped_logs_total",
            "host" => self.host.to_owned(),
            "reason" => self.reason,
        )
        .increment(self.count);
    }
}

/// Kubernetes metadata could not be recovered for a record.
pub struct MetadataMissing {
    /// Whether the record was dropped as a result.
    pub dropped: bool,
}

impl MetadataMissing {
    pub fn emit(self) {
        if self.dropped {
            counter!("logs_without_metadata_total", "type" => "Kubernetes").increment(1);
        } else {
            counter!("errors_total", "type" => "metadata_extraction").increment(1);
        }
    }
}

/// A transport send failed.
pub struct TransportSendFailed<'a> {
    /// Endpoint label of the failing transport.
    pub endpoint: &'a str,
    /// Rendered failure.
    pub error: String,
    /// Whether the batch will be retried.
    pub retriable: bool,
}

impl TransportSendFailed<'_> {
    pub fn emit(self) {
        if self.retriable {
            warn!(
                message = "Transport send failed; batch will be retried.",
                endpoint = %self.endpoint,
                error = %self.error,
            );
            counter!("errors_total", "type" => "transport_retriable").increment(1);
        } else {
            error!(
                message = "Transport send failed fatally; batch discarded.",
                endpoint = %self.endpoint,
                error = %self.error,
            );
            counter!("errors_total", "type" => "transport_fatal").increment(1);
        }
    }
}

/// The reconciler observed an event it could not apply.
pub struct ReconcileFailed<'a> {
    /// Affected tenant.
    pub tenant: &'a str,
    /// Rendered failure.
    pub error: String,
}

impl ReconcileFailed<'_> {
    pub fn emit(self) {
        warn!(
            message = "Failed to reconcile tenant.",
            tenant = %self.tenant,
            error = %self.error,
        );
        counter!("errors_total", "type" => "reconcile").increment(1);
    }
}
