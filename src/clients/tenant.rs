//! Tenant-state client: fan-out to the shoot and seed targets, gated by the
//! lifecycle policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use super::{HandleOutcome, LogClient};
use crate::entry::Entry;
use crate::error::ForwardError;
use crate::internal_events::{drop_reason, DroppedLogs};
use crate::tenant::{ClientPolicy, LifecycleState};

/// Composite client with one handle per target.
///
/// Mute flags are plain relaxed atomics, not a lock: a record racing a state
/// transition may observe one stale flag, which loses at most a handful of
/// records around the transition and keeps the hot path contention-free.
pub struct TenantClient {
    name: String,
    shoot: Arc<dyn LogClient>,
    seed: Arc<dyn LogClient>,
    mute_shoot: AtomicBool,
    mute_seed: AtomicBool,
    state: Mutex<LifecycleState>,
    policy: ClientPolicy,
}

impl TenantClient {
    /// Builds the client with mute flags derived from the initial state.
    pub fn new(
        name: impl Into<String>,
        shoot: Arc<dyn LogClient>,
        seed: Arc<dyn LogClient>,
        policy: ClientPolicy,
        initial_state: LifecycleState,
    ) -> Self {
        TenantClient {
            name: name.into(),
            shoot,
            seed,
            mute_shoot: AtomicBool::new(!policy.shoot.forwards_in(initial_state)),
            mute_seed: AtomicBool::new(!policy.seed.forwards_in(initial_state)),
            state: Mutex::new(initial_state),
            policy,
        }
    }

    /// Tenant name this client serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the given target currently forwards records.
    pub fn target_active(&self, seed: bool) -> bool {
        if seed {
            !self.mute_seed.load(Ordering::Relaxed)
        } else {
            !self.mute_shoot.load(Ordering::Relaxed)
        }
    }

    /// Applies a state transition, re-deriving both mute flags.
    pub fn set_state(&self, new: LifecycleState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == new {
            return;
        }
        let old = *state;
        *state = new;
        self.mute_shoot
            .store(!self.policy.shoot.forwards_in(new), Ordering::Relaxed);
        self.mute_seed
            .store(!self.policy.seed.forwards_in(new), Ordering::Relaxed);
        info!(
            message = "Tenant changed lifecycle state.",
            tenant = %self.name,
            from = %old,
            to = %new,
        );
    }
}

impl LogClient for TenantClient {
    fn handle(&self, entry: Entry) -> Result<HandleOutcome, ForwardError> {
        let send_shoot = !self.mute_shoot.load(Ordering::Relaxed);
        let send_seed = !self.mute_seed.load(Ordering::Relaxed);

        if !send_shoot && !send_seed {
            DroppedLogs {
                host: &self.name,
                reason: drop_reason::MUTED,
                count: 1,
            }
            .emit();
            return Ok(HandleOutcome::Discarded);
        }

        // Each target gets its own copy so neither can observe the other's
        // label mutations downstream.
        let mut first_error = None;
        let mut accepted = false;
        if send_shoot {
            match self.shoot.handle(entry.clone()) {
                Ok(HandleOutcome::Accepted) => accepted = true,
                Ok(HandleOutcome::Discarded) => {}
                Err(e) => first_error = Some(e),
            }
        }
        if send_seed {
            match self.seed.handle(entry) {
                Ok(HandleOutcome::Accepted) => accepted = true,
                Ok(HandleOutcome::Discarded) => {}
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }

        match (accepted, first_error) {
            // One target failing does not abort the other; a partial accept
            // counts as accepted.
            (true, _) => Ok(HandleOutcome::Accepted),
            (false, Some(error)) => Err(error),
            (false, None) => Ok(HandleOutcome::Discarded),
        }
    }

    fn endpoint(&self) -> &str {
        self.shoot.endpoint()
    }

    fn stop(&self) {
        // The seed handle is shared with the facade, which stops it last.
        self.shoot.stop();
    }

    fn stop_wait(&self) {
        self.shoot.stop_wait();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;

    use super::*;
    use crate::entry::Labels;
    use crate::tenant::TargetPolicy;

    #[derive(Default)]
    struct CountingClient {
        handled: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl LogClient for CountingClient {
        fn handle(&self, _entry: Entry) -> Result<HandleOutcome, ForwardError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(HandleOutcome::Accepted)
        }

        fn endpoint(&self) -> &str {
            "counting"
        }

        fn stop(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn stop_wait(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn entry() -> Entry {
        Entry {
            labels: Labels::new(),
            timestamp: Utc::now(),
            line: "x".into(),
        }
    }

    fn all(on: bool) -> TargetPolicy {
        TargetPolicy {
            creation: on,
            ready: on,
            hibernating: on,
            hibernated: on,
            deletion: on,
            restore: on,
            migration: on,
        }
    }

    #[test]
    fn records_reach_only_unmuted_targets() {
        let shoot = Arc::new(CountingClient::default());
        let seed = Arc::new(CountingClient::default());
        let policy = ClientPolicy {
            shoot: TargetPolicy {
                ready: true,
                hibernated: false,
                ..all(false)
            },
            seed: TargetPolicy {
                ready: false,
                hibernated: true,
                ..all(false)
            },
        };
        let client = TenantClient::new(
            "shoot--dev--a",
            Arc::clone(&shoot) as Arc<dyn LogClient>,
            Arc::clone(&seed) as Arc<dyn LogClient>,
            policy,
            LifecycleState::Ready,
        );

        client.handle(entry()).unwrap();
        assert_eq!(shoot.handled.load(Ordering::SeqCst), 1);
        assert_eq!(seed.handled.load(Ordering::SeqCst), 0);

        client.set_state(LifecycleState::Hibernated);
        client.handle(entry()).unwrap();
        assert_eq!(shoot.handled.load(Ordering::SeqCst), 1);
        assert_eq!(seed.handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fully_muted_client_discards() {
        let shoot = Arc::new(CountingClient::default());
        let seed = Arc::new(CountingClient::default());
        let policy = ClientPolicy {
            shoot: all(false),
            seed: all(false),
        };
        let client = TenantClient::new(
            "t",
            Arc::clone(&shoot) as Arc<dyn LogClient>,
            Arc::clone(&seed) as Arc<dyn LogClient>,
            policy,
            LifecycleState::Ready,
        );

        assert_eq!(client.handle(entry()).unwrap(), HandleOutcome::Discarded);
        assert_eq!(shoot.handled.load(Ordering::SeqCst), 0);
        assert_eq!(seed.handled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn set_state_to_same_state_is_a_no_op() {
        let shoot = Arc::new(CountingClient::default());
        let seed = Arc::new(CountingClient::default());
        let client = TenantClient::new(
            "t",
            shoot as Arc<dyn LogClient>,
            seed as Arc<dyn LogClient>,
            ClientPolicy::default(),
            LifecycleState::Ready,
        );

        client.set_state(LifecycleState::Ready);
        assert_eq!(client.state(), LifecycleState::Ready);
        assert!(client.target_active(false));
    }

    #[test]
    fn stop_does_not_touch_the_shared_seed_handle() {
        let shoot = Arc::new(CountingClient::default());
        let seed = Arc::new(CountingClient::default());
        let client = TenantClient::new(
            "t",
            Arc::clone(&shoot) as Arc<dyn LogClient>,
            Arc::clone(&seed) as Arc<dyn LogClient>,
            ClientPolicy::default(),
            LifecycleState::Ready,
        );

        client.stop_wait();
        assert_eq!(shoot.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(seed.stopped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn one_failing_target_does_not_block_the_other() {
        struct FailingClient;
        impl LogClient for FailingClient {
            fn handle(&self, _entry: Entry) -> Result<HandleOutcome, ForwardError> {
                Err(ForwardError::Enqueue {
                    reason: "disk error".into(),
                })
            }
            fn endpoint(&self) -> &str {
                "failing"
            }
            fn stop(&self) {}
            fn stop_wait(&self) {}
        }

        let seed = Arc::new(CountingClient::default());
        let policy = ClientPolicy {
            shoot: all(true),
            seed: all(true),
        };
        let client = TenantClient::new(
            "t",
            Arc::new(FailingClient) as Arc<dyn LogClient>,
            Arc::clone(&seed) as Arc<dyn LogClient>,
            policy,
            LifecycleState::Ready,
        );

        assert_eq!(client.handle(entry()).unwrap(), HandleOutcome::Accepted);
        assert_eq!(seed.handled.load(Ordering::SeqCst), 1);
    }
}
