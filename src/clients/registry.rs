//! Client registry and tenant reconciler.
//!
//! The registry owns one [`TenantClient`] per loggable tenant and keeps that
//! set in step with a stream of tenant resource events. The event source is
//! a trait so production can bind an informer while tests drive the registry
//! with the in-memory implementation below.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::tenant::TenantClient;
use super::LogClient;
use crate::error::BuildError;
use crate::internal_events::ReconcileFailed;
use crate::tenant::{LifecycleState, TenantDescriptor};

/// A tenant resource as observed by the event source.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TenantResource {
    /// Resource name; must match the embedded tenant name.
    pub name: String,
    /// The raw resource document.
    pub raw: Vec<u8>,
}

/// Callbacks the registry registers against the event source.
pub trait TenantEventHandler: Send + Sync {
    /// A tenant appeared.
    fn on_add(&self, resource: &TenantResource);
    /// A tenant changed.
    fn on_update(&self, old: &TenantResource, new: &TenantResource);
    /// A tenant disappeared.
    fn on_delete(&self, resource: &TenantResource);
}

/// The injected stream of tenant lifecycle events.
pub trait TenantEventSource: Send + Sync {
    /// Attaches a handler; existing resources are replayed as adds.
    fn register(&self, handler: Arc<dyn TenantEventHandler>);
    /// Whether the initial listing has been fully delivered.
    fn has_synced(&self) -> bool;
}

/// Builds a tenant client for a freshly observed tenant.
pub type ClientFactory = Box<
    dyn Fn(&TenantDescriptor, LifecycleState) -> Result<TenantClient, BuildError> + Send + Sync,
>;

/// Result of a registry lookup.
#[derive(Clone)]
pub enum GetOutcome {
    /// A live client for the tenant.
    Found(Arc<TenantClient>),
    /// No client registered under that key.
    NotFound,
    /// The registry has been stopped; the caller must treat this as
    /// terminal and fall back to the seed.
    Stopped,
}

/// Expected number of concurrently active tenants per node.
const EXPECTED_ACTIVE_TENANTS: usize = 128;

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Registry {
    clients: RwLock<HashMap<String, Arc<TenantClient>>>,
    stopped: AtomicBool,
    factory: ClientFactory,
    runtime: tokio::runtime::Handle,
}

impl Registry {
    /// Creates the registry, attaches it to the event source, and waits for
    /// the initial sync.
    ///
    /// Failing to sync within `sync_timeout` is a fatal construction error.
    pub fn start(
        factory: ClientFactory,
        source: &dyn TenantEventSource,
        sync_timeout: Duration,
        runtime: tokio::runtime::Handle,
    ) -> Result<Arc<Registry>, BuildError> {
        let registry = Arc::new(Registry {
            clients: RwLock::new(HashMap::with_capacity(EXPECTED_ACTIVE_TENANTS)),
            stopped: AtomicBool::new(false),
            factory,
            runtime,
        });
        source.register(Arc::clone(&registry) as Arc<dyn TenantEventHandler>);

        let deadline = Instant::now() + sync_timeout;
        while !source.has_synced() {
            if Instant::now() >= deadline {
                return Err(BuildError::SyncTimeout {
                    timeout: sync_timeout,
                });
            }
            std::thread::sleep(SYNC_POLL_INTERVAL);
        }
        info!(message = "Tenant registry synced.", tenants = registry.len());
        Ok(registry)
    }

    /// Looks up the client for a tenant key.
    pub fn get(&self, name: &str) -> GetOutcome {
        if self.stopped.load(Ordering::SeqCst) {
            return GetOutcome::Stopped;
        }
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        match clients.get(name) {
            Some(client) => GetOutcome::Found(Arc::clone(client)),
            None => GetOutcome::NotFound,
        }
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether no clients are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every client (draining each) and detaches from the event
    /// source by making all handlers inert.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Arc<TenantClient>> = {
            let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in drained {
            client.stop_wait();
        }
        info!(message = "Tenant registry stopped.");
    }

    fn add_tenant(&self, resource: &TenantResource) {
        let descriptor = match TenantDescriptor::decode(&resource.raw) {
            Ok(descriptor) => descriptor,
            Err(error) => {
                ReconcileFailed {
                    tenant: &resource.name,
                    error: error.to_string(),
                }
                .emit();
                return;
            }
        };
        if !descriptor.is_loggable() {
            debug!(
                message = "Ignoring non-loggable tenant.",
                tenant = %descriptor.name,
            );
            return;
        }

        {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            if clients.contains_key(&descriptor.name) {
                warn!(
                    message = "Duplicate add for tenant; keeping existing client.",
                    tenant = %descriptor.name,
                );
                return;
            }
        }

        // Construction opens queues and spawns the dequeuer, so it happens
        // outside the registry lock.
        let state = descriptor.derive_state();
        let client = match (self.factory)(&descriptor, state) {
            Ok(client) => Arc::new(client),
            Err(error) => {
                ReconcileFailed {
                    tenant: &descriptor.name,
                    error: error.to_string(),
                }
                .emit();
                return;
            }
        };

        let raced = {
            let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
            if clients.contains_key(&descriptor.name) {
                true
            } else {
                clients.insert(descriptor.name.clone(), Arc::clone(&client));
                false
            }
        };
        if raced {
            warn!(
                message = "Duplicate add for tenant; keeping existing client.",
                tenant = %descriptor.name,
            );
            client.stop();
            return;
        }
        info!(
            message = "Registered tenant client.",
            tenant = %descriptor.name,
            state = %state,
        );
    }

    fn remove_tenant(&self, name: &str, drain_async: bool) {
        let removed = {
            let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
            clients.remove(name)
        };
        let Some(client) = removed else { return };
        info!(message = "Removing tenant client.", tenant = %name);
        if drain_async {
            // Draining blocks on the dequeuer; keep it off the event thread.
            self.runtime.spawn_blocking(move || client.stop_wait());
        } else {
            client.stop_wait();
        }
    }
}

impl TenantEventHandler for Registry {
    fn on_add(&self, resource: &TenantResource) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.add_tenant(resource);
    }

    fn on_update(&self, old: &TenantResource, new: &TenantResource) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if old.raw == new.raw {
            return;
        }
        let descriptor = match TenantDescriptor::decode(&new.raw) {
            Ok(descriptor) => descriptor,
            Err(error) => {
                ReconcileFailed {
                    tenant: &new.name,
                    error: error.to_string(),
                }
                .emit();
                return;
            }
        };

        if !descriptor.is_loggable() {
            self.remove_tenant(&descriptor.name, true);
            return;
        }

        let existing = {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            clients.get(&descriptor.name).cloned()
        };
        match existing {
            Some(client) => client.set_state(descriptor.derive_state()),
            None => self.add_tenant(new),
        }
    }

    fn on_delete(&self, resource: &TenantResource) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.remove_tenant(&resource.name, true);
    }
}

/// In-memory event source.
///
/// Replays known resources as adds when a handler registers, then forwards
/// every mutation, mirroring how an informer cache behaves. Tests and local
/// drivers use this; production binds the informer machinery externally.
#[derive(Default)]
pub struct InMemoryEventSource {
    handlers: Mutex<Vec<Arc<dyn TenantEventHandler>>>,
    resources: Mutex<HashMap<String, TenantResource>>,
    synced: AtomicBool,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        InMemoryEventSource {
            handlers: Mutex::new(Vec::new()),
            resources: Mutex::new(HashMap::new()),
            synced: AtomicBool::new(true),
        }
    }

    /// Marks the source as (not) synced; used to exercise sync timeouts.
    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    /// Adds or replaces a resource, emitting the matching event.
    pub fn upsert(&self, resource: TenantResource) {
        let old = {
            let mut resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
            resources.insert(resource.name.clone(), resource.clone())
        };
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for handler in handlers {
            match &old {
                Some(old) => handler.on_update(old, &resource),
                None => handler.on_add(&resource),
            }
        }
    }

    /// Deletes a resource, emitting the matching event.
    pub fn delete(&self, name: &str) {
        let removed = {
            let mut resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
            resources.remove(name)
        };
        let Some(resource) = removed else { return };
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for handler in handlers {
            handler.on_delete(&resource);
        }
    }
}

impl TenantEventSource for InMemoryEventSource {
    fn register(&self, handler: Arc<dyn TenantEventHandler>) {
        let existing: Vec<TenantResource> = {
            let resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
            resources.values().cloned().collect()
        };
        for resource in &existing {
            handler.on_add(resource);
        }
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::clients::{HandleOutcome, LogClient};
    use crate::entry::Entry;
    use crate::error::ForwardError;
    use crate::tenant::ClientPolicy;

    #[derive(Default)]
    struct InertClient {
        stop_waits: AtomicUsize,
    }

    impl LogClient for InertClient {
        fn handle(&self, _entry: Entry) -> Result<HandleOutcome, ForwardError> {
            Ok(HandleOutcome::Accepted)
        }
        fn endpoint(&self) -> &str {
            "inert"
        }
        fn stop(&self) {}
        fn stop_wait(&self) {
            self.stop_waits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn factory() -> (ClientFactory, Arc<Mutex<Vec<Arc<InertClient>>>>) {
        let created: Arc<Mutex<Vec<Arc<InertClient>>>> = Arc::default();
        let captured = Arc::clone(&created);
        let factory: ClientFactory = Box::new(move |descriptor, state| {
            let shoot = Arc::new(InertClient::default());
            captured.lock().unwrap().push(Arc::clone(&shoot));
            Ok(TenantClient::new(
                descriptor.name.clone(),
                shoot as Arc<dyn LogClient>,
                Arc::new(InertClient::default()) as Arc<dyn LogClient>,
                ClientPolicy::default(),
                state,
            ))
        });
        (factory, created)
    }

    fn resource(name: &str, body: serde_json::Value) -> TenantResource {
        let mut body = body;
        body["metadata"]["name"] = serde_json::json!(name);
        TenantResource {
            name: name.to_owned(),
            raw: body.to_string().into_bytes(),
        }
    }

    fn ready_resource(name: &str) -> TenantResource {
        resource(
            name,
            serde_json::json!({
                "metadata": {},
                "status": {"lastOperation": {"type": "Reconcile", "state": "Succeeded"}},
            }),
        )
    }

    fn runtime_handle(runtime: &tokio::runtime::Runtime) -> tokio::runtime::Handle {
        runtime.handle().clone()
    }

    #[test]
    fn add_registers_one_client_per_tenant() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let source = InMemoryEventSource::new();
        let (factory, _created) = factory();
        let registry = Registry::start(
            factory,
            &source,
            Duration::from_secs(1),
            runtime_handle(&runtime),
        )
        .unwrap();

        source.upsert(ready_resource("shoot--dev--a"));
        assert!(matches!(registry.get("shoot--dev--a"), GetOutcome::Found(_)));
        assert_eq!(registry.len(), 1);

        // Replaying the identical resource keeps one client.
        let same = ready_resource("shoot--dev--a");
        let handlers: Arc<dyn TenantEventHandler> = Arc::clone(&registry) as _;
        handlers.on_add(&same);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn testing_tenants_are_ignored() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let source = InMemoryEventSource::new();
        let (factory, _created) = factory();
        let registry = Registry::start(
            factory,
            &source,
            Duration::from_secs(1),
            runtime_handle(&runtime),
        )
        .unwrap();

        source.upsert(resource(
            "shoot--test--x",
            serde_json::json!({"metadata": {}, "spec": {"purpose": "testing"}}),
        ));
        assert!(matches!(
            registry.get("shoot--test--x"),
            GetOutcome::NotFound
        ));
    }

    #[test]
    fn update_transitions_state_without_replacing_the_client() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let source = InMemoryEventSource::new();
        let (factory, _created) = factory();
        let registry = Registry::start(
            factory,
            &source,
            Duration::from_secs(1),
            runtime_handle(&runtime),
        )
        .unwrap();

        source.upsert(ready_resource("shoot--dev--a"));
        let GetOutcome::Found(before) = registry.get("shoot--dev--a") else {
            panic!("client missing");
        };
        assert_eq!(before.state(), LifecycleState::Ready);

        source.upsert(resource(
            "shoot--dev--a",
            serde_json::json!({
                "metadata": {},
                "spec": {"hibernation": {"enabled": true}},
                "status": {
                    "isHibernated": true,
                    "lastOperation": {"type": "Reconcile", "state": "Succeeded"},
                },
            }),
        ));

        let GetOutcome::Found(after) = registry.get("shoot--dev--a") else {
            panic!("client missing");
        };
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.state(), LifecycleState::Hibernated);
    }

    #[test]
    fn update_to_non_loggable_removes_the_client() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let source = InMemoryEventSource::new();
        let (factory, created) = factory();
        let registry = Registry::start(
            factory,
            &source,
            Duration::from_secs(1),
            runtime_handle(&runtime),
        )
        .unwrap();

        source.upsert(ready_resource("shoot--dev--a"));
        source.upsert(resource(
            "shoot--dev--a",
            serde_json::json!({
                "metadata": {"deletionTimestamp": "2024-05-01T00:00:00Z"},
            }),
        ));

        assert!(matches!(
            registry.get("shoot--dev--a"),
            GetOutcome::NotFound
        ));
        // The drain runs on a background task; give it a moment.
        let shoot = Arc::clone(&created.lock().unwrap()[0]);
        for _ in 0..100 {
            if shoot.stop_waits.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(shoot.stop_waits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delete_removes_and_drains() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let source = InMemoryEventSource::new();
        let (factory, created) = factory();
        let registry = Registry::start(
            factory,
            &source,
            Duration::from_secs(1),
            runtime_handle(&runtime),
        )
        .unwrap();

        source.upsert(ready_resource("shoot--dev--a"));
        source.delete("shoot--dev--a");

        assert!(matches!(
            registry.get("shoot--dev--a"),
            GetOutcome::NotFound
        ));
        let shoot = Arc::clone(&created.lock().unwrap()[0]);
        for _ in 0..100 {
            if shoot.stop_waits.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(shoot.stop_waits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_registry_reports_stopped() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let source = InMemoryEventSource::new();
        let (factory, created) = factory();
        let registry = Registry::start(
            factory,
            &source,
            Duration::from_secs(1),
            runtime_handle(&runtime),
        )
        .unwrap();

        source.upsert(ready_resource("shoot--dev--a"));
        registry.stop();

        assert!(matches!(registry.get("shoot--dev--a"), GetOutcome::Stopped));
        assert_eq!(registry.len(), 0);
        assert_eq!(created.lock().unwrap()[0].stop_waits.load(Ordering::SeqCst), 1);

        // Events after stop are ignored.
        source.upsert(ready_resource("shoot--dev--b"));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn replay_on_register_counts_as_initial_sync() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let source = InMemoryEventSource::new();
        source.upsert(ready_resource("shoot--pre--existing"));

        let (factory, _created) = factory();
        let registry = Registry::start(
            factory,
            &source,
            Duration::from_secs(1),
            runtime_handle(&runtime),
        )
        .unwrap();

        assert!(matches!(
            registry.get("shoot--pre--existing"),
            GetOutcome::Found(_)
        ));
    }

    #[test]
    fn sync_timeout_is_fatal() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let source = InMemoryEventSource::new();
        source.set_synced(false);

        let (factory, _created) = factory();
        let result = Registry::start(
            factory,
            &source,
            Duration::from_millis(50),
            runtime_handle(&runtime),
        );
        assert!(matches!(result, Err(BuildError::SyncTimeout { .. })));
    }
}
