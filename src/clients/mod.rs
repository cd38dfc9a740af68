//! Send chains: transports, decorators, buffering, tenant fan-out, and the
//! client registry.
//!
//! A chain is composed, never subclassed: each decorator wraps an inner
//! [`LogClient`] and implements the same interface. The hot path talks to
//! the outermost decorator only.

pub mod buffered;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod tenant;
pub mod throttle;
pub mod transport;

use crate::entry::Entry;
use crate::error::ForwardError;

/// What a chain did with an accepted record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandleOutcome {
    /// The record was queued for delivery.
    Accepted,
    /// The record was intentionally discarded (and counted by the chain).
    Discarded,
}

/// The synchronous hot-path interface every chain element implements.
///
/// `handle` must return without waiting on network I/O; delivery happens on
/// the chain's background task.
pub trait LogClient: Send + Sync {
    /// Accepts one entry for delivery.
    fn handle(&self, entry: Entry) -> Result<HandleOutcome, ForwardError>;

    /// Identifier of the chain's final destination, used as a metric label.
    fn endpoint(&self) -> &str;

    /// Stops the chain without draining; queued entries stay on disk.
    fn stop(&self);

    /// Stops the chain after draining in-flight batches, within a bounded
    /// window.
    fn stop_wait(&self);
}
