//! Multi-tenant log-forwarding output core.
//!
//! Routes container log records from a node agent to per-tenant ("shoot")
//! and shared ("seed") ingestion backends. The pipeline sits between the
//! host's flush callback and the outbound network clients:
//!
//! - the [`router`] extracts a tenant key from each record, shapes labels,
//!   and picks the downstream chain;
//! - the [`clients::registry`] follows tenant lifecycle events and keeps one
//!   live client per loggable tenant;
//! - each send chain layers throttling and retry over a durable on-disk
//!   queue (`logshuttle-queue`) in front of a concrete transport.
//!
//! The [`host`] module is the thin boundary the host process drives; see
//! [`host::HostPlugin`] for the init / flush / exit contract.

pub mod clients;
pub mod config;
pub mod entry;
pub mod error;
pub mod event;
pub mod host;
pub mod internal_events;
pub mod pipeline;
pub mod router;
pub mod tenant;

pub use clients::registry::{
    InMemoryEventSource, TenantEventHandler, TenantEventSource, TenantResource,
};
pub use config::{Config, ConfigLookup};
pub use entry::{Entry, Labels, LineFormat};
pub use error::{BuildError, RouterError};
pub use event::{normalize, RawRecord, RawValue, Record, Value};
pub use host::{FlushOutcome, HostPlugin};
pub use pipeline::Pipeline;
pub use tenant::{ClientPolicy, LifecycleState, TenantDescriptor};
