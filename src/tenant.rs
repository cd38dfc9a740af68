//! Tenant resources: descriptor decoding, lifecycle state derivation, and
//! the per-state forwarding policy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// Annotation key carrying an explicitly requested operation.
const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";

/// Tenant purposes that are never forwarded.
const PURPOSE_TESTING: &str = "testing";

/// Lifecycle state of a tenant, derived from its resource.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LifecycleState {
    /// The tenant is being created.
    Creation,
    /// The tenant is fully operational.
    Ready,
    /// The tenant is shutting down into hibernation.
    Hibernating,
    /// The tenant is hibernated.
    Hibernated,
    /// The tenant is waking up from hibernation.
    WakingUp,
    /// The tenant is being deleted.
    Deletion,
    /// The tenant is being migrated to another seed.
    Migration,
    /// The tenant is being restored after a migration.
    Restore,
}

impl LifecycleState {
    /// All states, in derivation-rule order.
    pub const ALL: [LifecycleState; 8] = [
        LifecycleState::Creation,
        LifecycleState::Ready,
        LifecycleState::Hibernating,
        LifecycleState::Hibernated,
        LifecycleState::WakingUp,
        LifecycleState::Deletion,
        LifecycleState::Migration,
        LifecycleState::Restore,
    ];
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Creation => "creation",
            LifecycleState::Ready => "ready",
            LifecycleState::Hibernating => "hibernating",
            LifecycleState::Hibernated => "hibernated",
            LifecycleState::WakingUp => "waking_up",
            LifecycleState::Deletion => "deletion",
            LifecycleState::Migration => "migration",
            LifecycleState::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Error decoding a tenant resource.
#[derive(Debug, Snafu)]
pub enum DecodeError {
    /// The resource bytes were not valid JSON of the expected shape.
    #[snafu(display("failed to decode tenant resource: {}", source))]
    Malformed {
        /// The underlying error.
        source: serde_json::Error,
    },
    /// The resource carries no name.
    #[snafu(display("tenant resource has no name"))]
    Unnamed,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceHibernation {
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpec {
    #[serde(default)]
    purpose: Option<String>,
    #[serde(default)]
    hibernation: Option<ResourceHibernation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceLastOperation {
    #[serde(default, rename = "type")]
    op_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceStatus {
    #[serde(default)]
    is_hibernated: bool,
    #[serde(default)]
    last_operation: Option<ResourceLastOperation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Resource {
    #[serde(default)]
    metadata: ResourceMetadata,
    #[serde(default)]
    spec: ResourceSpec,
    #[serde(default)]
    status: ResourceStatus,
}

/// Requested or running operation on a tenant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Create,
    Migrate,
    Restore,
    Other,
}

/// Completion state of the last operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationState {
    Succeeded,
    Other,
}

/// Last recorded operation on a tenant resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LastOperation {
    /// What kind of operation ran.
    pub op_type: Operation,
    /// Whether it completed.
    pub state: OperationState,
}

/// Structured representation of a tenant resource.
#[derive(Clone, Debug)]
pub struct TenantDescriptor {
    /// Tenant name; doubles as the routing key.
    pub name: String,
    /// Declared purpose, lowercased.
    pub purpose: Option<String>,
    /// Whether hibernation is requested.
    pub hibernation_enabled: bool,
    /// Whether the tenant reports itself hibernated.
    pub is_hibernated: bool,
    /// Deletion marker.
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Explicitly requested operation, from annotations.
    pub requested_operation: Option<Operation>,
    /// Last recorded operation.
    pub last_operation: Option<LastOperation>,
}

impl TenantDescriptor {
    /// Decodes a descriptor from raw tenant resource bytes.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let resource: Resource = serde_json::from_slice(raw).context(MalformedSnafu)?;
        let name = resource.metadata.name.ok_or(DecodeError::Unnamed)?;

        let requested_operation = resource
            .metadata
            .annotations
            .get(OPERATION_ANNOTATION)
            .map(|op| parse_operation(op));
        let last_operation = resource.status.last_operation.map(|op| LastOperation {
            op_type: op.op_type.as_deref().map(parse_operation).unwrap_or(Operation::Other),
            state: match op.state.as_deref() {
                Some("Succeeded") => OperationState::Succeeded,
                _ => OperationState::Other,
            },
        });

        Ok(TenantDescriptor {
            name,
            purpose: resource.spec.purpose.map(|p| p.to_ascii_lowercase()),
            hibernation_enabled: resource
                .spec
                .hibernation
                .map(|h| h.enabled)
                .unwrap_or(false),
            is_hibernated: resource.status.is_hibernated,
            deletion_timestamp: resource.metadata.deletion_timestamp,
            requested_operation,
            last_operation,
        })
    }

    /// Whether this tenant's logs are forwarded at all.
    ///
    /// Testing tenants and tenants marked for deletion are not loggable.
    pub fn is_loggable(&self) -> bool {
        self.purpose.as_deref() != Some(PURPOSE_TESTING) && self.deletion_timestamp.is_none()
    }

    /// Derives the lifecycle state; the first matching rule wins.
    pub fn derive_state(&self) -> LifecycleState {
        if self.deletion_timestamp.is_some() {
            return LifecycleState::Deletion;
        }
        if self.requested_operation == Some(Operation::Migrate)
            || self.unfinished_operation(Operation::Migrate)
        {
            return LifecycleState::Migration;
        }
        if self.requested_operation == Some(Operation::Restore)
            || self.unfinished_operation(Operation::Restore)
        {
            return LifecycleState::Restore;
        }
        if self.last_operation.is_none() || self.unfinished_operation(Operation::Create) {
            return LifecycleState::Creation;
        }
        match (self.hibernation_enabled, self.is_hibernated) {
            (true, false) => LifecycleState::Hibernating,
            (true, true) => LifecycleState::Hibernated,
            (false, true) => LifecycleState::WakingUp,
            (false, false) => LifecycleState::Ready,
        }
    }

    fn unfinished_operation(&self, op: Operation) -> bool {
        self.last_operation
            .is_some_and(|last| last.op_type == op && last.state != OperationState::Succeeded)
    }
}

fn parse_operation(op: &str) -> Operation {
    match op {
        "Create" | "create" => Operation::Create,
        "Migrate" | "migrate" => Operation::Migrate,
        "Restore" | "restore" => Operation::Restore,
        _ => Operation::Other,
    }
}

/// Per-target forwarding flags, one per lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TargetPolicy {
    pub creation: bool,
    pub ready: bool,
    pub hibernating: bool,
    pub hibernated: bool,
    pub deletion: bool,
    pub restore: bool,
    pub migration: bool,
}

impl TargetPolicy {
    /// Whether this target forwards records while the tenant is in `state`.
    ///
    /// `WakingUp` has no configuration key of its own and shares the
    /// hibernating column, being the same transitional condition in the
    /// other direction.
    pub fn forwards_in(&self, state: LifecycleState) -> bool {
        match state {
            LifecycleState::Creation => self.creation,
            LifecycleState::Ready => self.ready,
            LifecycleState::Hibernating | LifecycleState::WakingUp => self.hibernating,
            LifecycleState::Hibernated => self.hibernated,
            LifecycleState::Deletion => self.deletion,
            LifecycleState::Restore => self.restore,
            LifecycleState::Migration => self.migration,
        }
    }
}

/// The 2×7 forwarding policy table: one column set per target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientPolicy {
    /// Flags for the tenant's dedicated backend.
    pub shoot: TargetPolicy,
    /// Flags for the shared backend.
    pub seed: TargetPolicy,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        // While the tenant backend is unreachable (creation, hibernation,
        // teardown) its logs are mirrored to the shared backend instead.
        ClientPolicy {
            shoot: TargetPolicy {
                creation: true,
                ready: true,
                hibernating: false,
                hibernated: false,
                deletion: false,
                restore: false,
                migration: false,
            },
            seed: TargetPolicy {
                creation: true,
                ready: false,
                hibernating: true,
                hibernated: true,
                deletion: true,
                restore: true,
                migration: true,
            },
        }
    }
}
