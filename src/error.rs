//! Error taxonomy shared across the pipeline.
//!
//! Transport and queue errors are recovered close to where they occur
//! (retried, persisted, or counted as drops); only conditions the host has to
//! act on cross the facade boundary.

use snafu::Snafu;

/// Classification attached to every transport failure.
///
/// Retriable errors keep the batch on disk for another delivery cycle;
/// fatal errors discard the batch after being counted.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    /// Transient condition: network failure, timeout, 5xx or 429 response.
    #[snafu(display("retriable transport error against {}: {}", endpoint, reason))]
    Retriable {
        /// Endpoint label of the failing transport.
        endpoint: String,
        /// Human-readable failure description.
        reason: String,
    },

    /// Permanent condition: malformed payload or a non-429 4xx response.
    #[snafu(display("fatal transport error against {}: {}", endpoint, reason))]
    Fatal {
        /// Endpoint label of the failing transport.
        endpoint: String,
        /// Human-readable failure description.
        reason: String,
    },
}

impl TransportError {
    /// Whether the failed batch should be delivered again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransportError::Retriable { .. })
    }
}

/// Error returned by a send chain's `handle`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ForwardError {
    /// The token bucket had no capacity; the caller may retry the record.
    #[snafu(display("send chain is throttled"))]
    Throttled,

    /// The on-disk queue is at capacity under the `reject` overflow policy.
    #[snafu(display("queue is full ({} records)", capacity))]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The record could not be placed onto the queue.
    #[snafu(display("failed to enqueue record: {}", reason))]
    Enqueue {
        /// Human-readable failure description.
        reason: String,
    },

    /// The chain has been stopped and accepts no further records.
    #[snafu(display("send chain is stopped"))]
    ChainStopped,
}

/// Error surfaced by `send_record` to the host adapter.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RouterError {
    /// The selected chain is throttled; the host should retry the flush.
    #[snafu(display("record throttled"))]
    RecordThrottled,

    /// The record was lost because the queue rejected it; the host should
    /// report an error for the flush.
    #[snafu(display("record rejected by a full queue"))]
    RecordRejected,
}

/// Fatal error while constructing the pipeline at `Init`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BuildError {
    /// A configuration value failed validation.
    #[snafu(display("invalid configuration for `{}`: {}", key, reason))]
    ConfigInvalid {
        /// The offending configuration key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The on-disk queue could not be opened.
    #[snafu(display("failed to open queue: {}", source))]
    QueueOpen {
        /// The underlying error.
        source: logshuttle_queue::OpenError,
    },

    /// A transport could not be constructed.
    #[snafu(display("failed to build transport for {}: {}", endpoint, reason))]
    TransportBuild {
        /// Endpoint the transport was meant to reach.
        endpoint: String,
        /// Why construction failed.
        reason: String,
    },

    /// The event source did not report sync within the configured timeout.
    #[snafu(display("tenant event source did not sync within {:?}", timeout))]
    SyncTimeout {
        /// The configured sync timeout.
        timeout: std::time::Duration,
    },

    /// The async runtime could not be started.
    #[snafu(display("failed to start runtime: {}", source))]
    Runtime {
        /// The underlying error.
        source: std::io::Error,
    },
}
