//! One actor per resource identity.
//!
//! The actor's mailbox serialises every event for its identity, so
//! reconciliations of one resource never overlap. A shared semaphore bounds
//! how many identities reconcile at once.

use std::sync::Arc;
use std::time::Duration;

use ractor::concurrency::JoinHandle;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use dprof_resources::{ResourceKey, ResourceObject};
use dprof_store::{EventKind, WatchEvent, calculate_backoff};

use crate::reconcile::{IdentityState, Reconcile};

/// Retry behaviour for reconciliations that hit transient errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` once exhausted.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            None
        } else {
            Some(calculate_backoff(
                attempt.saturating_sub(1),
                self.initial_backoff,
                self.max_backoff,
            ))
        }
    }
}

/// Messages handled by a resource actor.
#[derive(Debug, Clone)]
pub enum ResourceMessage<R> {
    /// A watch event for this identity.
    Event(WatchEvent<R>),
    /// Re-run an event whose reconciliation failed transiently.
    Retry { event: WatchEvent<R>, attempt: u32 },
}

/// Spawn arguments for a resource actor.
pub struct ResourceActorArgs {
    pub key: ResourceKey,
    pub permits: Arc<Semaphore>,
    /// A previous actor for the same identity that must finish first.
    pub predecessor: Option<JoinHandle<()>>,
    pub retry: RetryPolicy,
}

/// State for a resource actor.
pub struct ResourceActorState<M> {
    key: ResourceKey,
    permits: Arc<Semaphore>,
    predecessor: Option<JoinHandle<()>>,
    retry: RetryPolicy,
    identity: IdentityState<M>,
}

/// Actor definition wrapping a reconciler.
#[derive(Clone)]
pub struct ResourceActor<C> {
    reconciler: C,
}

impl<C: Reconcile> ResourceActor<C> {
    pub const fn new(reconciler: C) -> Self {
        Self { reconciler }
    }

    async fn run(
        &self,
        myself: &ActorRef<ResourceMessage<C::Resource>>,
        event: WatchEvent<C::Resource>,
        attempt: u32,
        state: &mut ResourceActorState<C::Memory>,
    ) {
        if event.kind == EventKind::Deleted {
            info!(resource = %state.key, "resource deleted, cleaning up");
            self.reconciler
                .cleanup(event.resource, &mut state.identity)
                .await;
            myself.stop(Some("resource deleted".to_string()));
            return;
        }

        let retry_event = event.clone();
        let Err(e) = self
            .reconciler
            .reconcile(event.resource, &mut state.identity)
            .await
        else {
            return;
        };

        let next_attempt = attempt.saturating_add(1);
        match state.retry.next_delay(next_attempt).filter(|_| e.is_transient()) {
            Some(delay) => {
                warn!(resource = %state.key, error = %e, attempt = next_attempt, delay_ms = delay.as_millis(), "reconcile failed, retrying");
                let target = myself.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = target.send_message(ResourceMessage::Retry {
                        event: retry_event,
                        attempt: next_attempt,
                    });
                });
            }
            None => warn!(resource = %state.key, error = %e, "reconcile failed"),
        }
    }
}

impl<C: Reconcile> Actor for ResourceActor<C> {
    type Msg = ResourceMessage<C::Resource>;
    type State = ResourceActorState<C::Memory>;
    type Arguments = ResourceActorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!(resource = %args.key, kind = C::Resource::KIND, "resource actor starting");
        Ok(ResourceActorState {
            key: args.key,
            permits: args.permits,
            predecessor: args.predecessor,
            retry: args.retry,
            identity: IdentityState::default(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        // A deleted-then-recreated identity waits for the old cleanup.
        if let Some(predecessor) = state.predecessor.take() {
            let _ = predecessor.await;
        }

        let _permit = state.permits.clone().acquire_owned().await?;
        match message {
            ResourceMessage::Event(event) => self.run(&myself, event, 0, state).await,
            ResourceMessage::Retry { event, attempt } => {
                debug!(resource = %state.key, attempt, "retrying reconcile");
                self.run(&myself, event, attempt, state).await;
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.identity.stop_monitor().await;
        debug!(resource = %state.key, "resource actor stopped");
        Ok(())
    }
}
