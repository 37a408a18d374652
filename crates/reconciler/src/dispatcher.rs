//! Routes watch events to per-identity actors.

use std::collections::HashMap;
use std::sync::Arc;

use ractor::concurrency::JoinHandle;
use ractor::{Actor, ActorRef};
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, info, warn};

use dprof_resources::{ResourceKey, ResourceObject};
use dprof_store::{EventKind, WatchEvent};

use crate::actor::{ResourceActor, ResourceActorArgs, ResourceMessage, RetryPolicy};
use crate::error::{Error, Result};
use crate::reconcile::Reconcile;

struct Slot<R> {
    actor: ActorRef<ResourceMessage<R>>,
    join: JoinHandle<()>,
}

/// Owns the actor of every live identity of one resource kind.
///
/// Events for one identity go to the same actor in arrival order. After a
/// `Deleted` event the identity's actor retires; an identity recreated under
/// the same name gets a fresh actor that waits for the retiring one.
pub struct EventDispatcher<C: Reconcile> {
    reconciler: C,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    actors: HashMap<ResourceKey, Slot<C::Resource>>,
    retiring: HashMap<ResourceKey, JoinHandle<()>>,
}

impl<C: Reconcile> EventDispatcher<C> {
    pub fn new(reconciler: C, permits: Arc<Semaphore>) -> Self {
        Self {
            reconciler,
            permits,
            retry: RetryPolicy::default(),
            actors: HashMap::new(),
            retiring: HashMap::new(),
        }
    }

    /// Set the retry policy for transient reconcile failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Number of identities with a live actor.
    pub fn active(&self) -> usize {
        self.actors.len()
    }

    async fn spawn(
        &mut self,
        key: &ResourceKey,
        predecessor: Option<JoinHandle<()>>,
    ) -> Result<Slot<C::Resource>> {
        let predecessor = predecessor.or_else(|| self.retiring.remove(key));
        let args = ResourceActorArgs {
            key: key.clone(),
            permits: self.permits.clone(),
            predecessor,
            retry: self.retry.clone(),
        };
        let (actor, join) = Actor::spawn(None, ResourceActor::new(self.reconciler.clone()), args)
            .await
            .map_err(|e| Error::actor(key, e.to_string()))?;
        debug!(resource = %key, kind = C::Resource::KIND, "spawned resource actor");
        Ok(Slot { actor, join })
    }

    /// Hand one event to its identity's actor.
    pub async fn dispatch(&mut self, event: WatchEvent<C::Resource>) -> Result<()> {
        self.retiring.retain(|_, join| !join.is_finished());

        let key = event.key();
        let deleted = event.kind == EventKind::Deleted;
        let mut slot = match self.actors.remove(&key) {
            Some(slot) => slot,
            None => self.spawn(&key, None).await?,
        };

        if slot
            .actor
            .send_message(ResourceMessage::Event(event.clone()))
            .is_err()
        {
            warn!(resource = %key, "resource actor gone, restarting it");
            slot = self.spawn(&key, Some(slot.join)).await?;
            slot.actor
                .send_message(ResourceMessage::Event(event))
                .map_err(|_| Error::actor(&key, "mailbox closed"))?;
        }

        if deleted {
            self.retiring.insert(key, slot.join);
        } else {
            self.actors.insert(key, slot);
        }
        Ok(())
    }

    /// Route events until shutdown or until the watcher goes away.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<WatchEvent<C::Resource>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(kind = C::Resource::KIND, "event dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let event = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(e) = self.dispatch(event).await {
                warn!(kind = C::Resource::KIND, error = %e, "failed to dispatch event");
            }
        }
        self.stop_all().await;
        info!(kind = C::Resource::KIND, "event dispatcher stopped");
    }

    /// Stop every actor and wait for them to wind down.
    pub async fn stop_all(self) {
        let mut joins = Vec::with_capacity(self.actors.len() + self.retiring.len());
        for (_, slot) in self.actors {
            slot.actor.stop(Some("shutdown".to_string()));
            joins.push(slot.join);
        }
        joins.extend(self.retiring.into_values());
        for join in joins {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use dprof_resources::{AlgorithmClass, ObjectMeta, ProfilingRequest, ProfilingRequestSpec};
    use tokio::sync::Mutex;

    use crate::reconcile::IdentityState;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    /// Records calls and tracks how many run at once per identity.
    #[derive(Clone, Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<(String, &'static str)>>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl Recording {
        async fn record(&self, name: &str, what: &'static str) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.calls.lock().await.push((name.to_string(), what));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Reconcile for Recording {
        type Resource = ProfilingRequest;
        type Memory = ();

        async fn reconcile(
            &self,
            resource: ProfilingRequest,
            _state: &mut IdentityState<()>,
        ) -> Result<()> {
            self.record(&resource.metadata.name, "reconcile").await;
            Ok(())
        }

        async fn cleanup(&self, resource: ProfilingRequest, _state: &mut IdentityState<()>) {
            self.record(&resource.metadata.name, "cleanup").await;
        }
    }

    fn event(kind: EventKind, name: &str) -> WatchEvent<ProfilingRequest> {
        WatchEvent {
            kind,
            resource: ProfilingRequest::new(
                ObjectMeta::new("default", name),
                ProfilingRequestSpec::new(AlgorithmClass::Sorting, "bubble_sort"),
            ),
        }
    }

    async fn wait_for_calls(recording: &Recording, count: usize) -> TestResult {
        for _ in 0..200 {
            if recording.calls.lock().await.len() >= count {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err("timed out waiting for calls".into())
    }

    #[tokio::test]
    async fn test_events_for_one_identity_never_overlap() -> TestResult {
        let recording = Recording::default();
        let mut dispatcher =
            EventDispatcher::new(recording.clone(), Arc::new(Semaphore::new(8)));

        dispatcher.dispatch(event(EventKind::Added, "sort-1000")).await?;
        dispatcher.dispatch(event(EventKind::Modified, "sort-1000")).await?;
        dispatcher.dispatch(event(EventKind::Deleted, "sort-1000")).await?;
        wait_for_calls(&recording, 3).await?;

        let calls = recording.calls.lock().await.clone();
        let order: Vec<_> = calls.iter().map(|(_, what)| *what).collect();
        assert_eq!(order, vec!["reconcile", "reconcile", "cleanup"]);
        assert_eq!(recording.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.active(), 0);
        dispatcher.stop_all().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_identities_run_concurrently() -> TestResult {
        let recording = Recording::default();
        let mut dispatcher =
            EventDispatcher::new(recording.clone(), Arc::new(Semaphore::new(8)));

        for name in ["a", "b", "c", "d"] {
            dispatcher.dispatch(event(EventKind::Added, name)).await?;
        }
        wait_for_calls(&recording, 4).await?;

        assert_eq!(dispatcher.active(), 4);
        assert!(recording.max_in_flight.load(Ordering::SeqCst) > 1);
        dispatcher.stop_all().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_semaphore_bounds_concurrency() -> TestResult {
        let recording = Recording::default();
        let mut dispatcher =
            EventDispatcher::new(recording.clone(), Arc::new(Semaphore::new(1)));

        for name in ["a", "b", "c"] {
            dispatcher.dispatch(event(EventKind::Added, name)).await?;
        }
        wait_for_calls(&recording, 3).await?;

        assert_eq!(recording.max_in_flight.load(Ordering::SeqCst), 1);
        dispatcher.stop_all().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_recreated_identity_waits_for_cleanup() -> TestResult {
        let recording = Recording::default();
        let mut dispatcher =
            EventDispatcher::new(recording.clone(), Arc::new(Semaphore::new(8)));

        dispatcher.dispatch(event(EventKind::Added, "fs-1")).await?;
        dispatcher.dispatch(event(EventKind::Deleted, "fs-1")).await?;
        dispatcher.dispatch(event(EventKind::Added, "fs-1")).await?;
        wait_for_calls(&recording, 3).await?;

        let calls = recording.calls.lock().await.clone();
        let order: Vec<_> = calls.iter().map(|(_, what)| *what).collect();
        assert_eq!(order, vec!["reconcile", "cleanup", "reconcile"]);
        assert_eq!(dispatcher.active(), 1);
        dispatcher.stop_all().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() -> TestResult {
        let recording = Recording::default();
        let dispatcher = EventDispatcher::new(recording.clone(), Arc::new(Semaphore::new(8)));
        let (events_tx, events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(dispatcher.run(events_rx, shutdown_rx));

        events_tx.send(event(EventKind::Added, "sort-1000")).await?;
        wait_for_calls(&recording, 1).await?;
        shutdown_tx.send(true)?;

        tokio::time::timeout(Duration::from_secs(2), task).await??;
        Ok(())
    }
}
