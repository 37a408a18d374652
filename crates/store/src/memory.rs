//! In-memory resource store.
//!
//! Versions are a single increasing counter shared by every object. A
//! bounded history of past events lets watchers resume from a bookmark;
//! anything older than the retained history is reported as
//! `BookmarkExpired`, as is a watcher that falls behind the live channel.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::debug;

use dprof_resources::{ResourceKey, ResourceObject};

use crate::error::{Error, Result};
use crate::store::{EventKind, ResourceList, ResourceStore, StreamItem, WatchEvent, WatchStream};

/// Default number of events retained for watch resumption.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

const LIVE_CHANNEL_CAPACITY: usize = 1024;

type Recorded<R> = (u64, EventKind, R);

struct State<R: ResourceObject> {
    objects: BTreeMap<ResourceKey, R>,
    version: u64,
    history: VecDeque<Recorded<R>>,
    /// Every event with a version above this is still in `history`.
    compacted_through: u64,
    pending_conflicts: u32,
    status_writes: HashMap<ResourceKey, Vec<R::Status>>,
}

impl<R: ResourceObject> Default for State<R> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            version: 0,
            history: VecDeque::new(),
            compacted_through: 0,
            pending_conflicts: 0,
            status_writes: HashMap::new(),
        }
    }
}

/// In-memory store for tests and local runs.
pub struct InMemoryResourceStore<R: ResourceObject> {
    state: RwLock<State<R>>,
    live: broadcast::Sender<Recorded<R>>,
    disconnect: watch::Sender<u64>,
    history_limit: usize,
}

impl<R: ResourceObject> Default for InMemoryResourceStore<R> {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl<R: ResourceObject> InMemoryResourceStore<R> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Create a store retaining at most `limit` events of history.
    pub fn with_history_limit(limit: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let (disconnect, _) = watch::channel(0);
        Self {
            state: RwLock::new(State::default()),
            live,
            disconnect,
            history_limit: limit.max(1),
        }
    }

    /// End every open watch stream, as a dropped connection would.
    pub fn disconnect_watchers(&self) {
        self.disconnect
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Drop all retained history so older bookmarks expire.
    pub async fn compact(&self) {
        let mut state = self.state.write().await;
        state.history.clear();
        state.compacted_through = state.version;
    }

    /// Make the next `count` status patches fail with a version conflict.
    pub async fn inject_conflicts(&self, count: u32) {
        self.state.write().await.pending_conflicts = count;
    }

    /// Every status successfully written for `key`, oldest first.
    pub async fn status_writes(&self, key: &ResourceKey) -> Vec<R::Status> {
        self.state
            .read()
            .await
            .status_writes
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Latest assigned version.
    pub async fn current_version(&self) -> u64 {
        self.state.read().await.version
    }

    fn record(&self, state: &mut State<R>, kind: EventKind, resource: &R) {
        let entry = (state.version, kind, resource.clone());
        state.history.push_back(entry.clone());
        while state.history.len() > self.history_limit {
            if let Some((dropped, _, _)) = state.history.pop_front() {
                state.compacted_through = dropped;
            }
        }
        // No receivers is fine; watchers catch up from history.
        let _ = self.live.send(entry);
    }
}

fn in_namespace(namespace: &str, key: &ResourceKey) -> bool {
    namespace.is_empty() || key.namespace == namespace
}

struct WatchState<R> {
    namespace: String,
    backlog: VecDeque<Recorded<R>>,
    live: broadcast::Receiver<Recorded<R>>,
    disconnect: watch::Receiver<u64>,
    last_delivered: u64,
    finished: bool,
}

async fn next_item<R: ResourceObject>(
    mut st: WatchState<R>,
) -> Option<(Result<StreamItem<R>>, WatchState<R>)> {
    if st.finished {
        return None;
    }
    loop {
        if let Some((version, kind, resource)) = st.backlog.pop_front() {
            st.last_delivered = version;
            return Some((Ok(StreamItem::Event(WatchEvent::new(kind, resource))), st));
        }

        tokio::select! {
            _ = st.disconnect.changed() => return None,
            received = st.live.recv() => match received {
                Ok((version, kind, resource)) => {
                    if version <= st.last_delivered || !in_namespace(&st.namespace, &resource.key()) {
                        continue;
                    }
                    st.last_delivered = version;
                    return Some((Ok(StreamItem::Event(WatchEvent::new(kind, resource))), st));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "watcher fell behind live channel");
                    st.finished = true;
                    let err = Error::bookmark_expired(st.last_delivered.to_string());
                    return Some((Err(err), st));
                }
                Err(RecvError::Closed) => return None,
            },
        }
    }
}

#[async_trait]
impl<R: ResourceObject> ResourceStore<R> for InMemoryResourceStore<R> {
    async fn list(&self, namespace: &str) -> Result<ResourceList<R>> {
        let state = self.state.read().await;
        let items = state
            .objects
            .iter()
            .filter(|(key, _)| in_namespace(namespace, key))
            .map(|(_, resource)| resource.clone())
            .collect();
        Ok(ResourceList {
            items,
            resource_version: state.version.to_string(),
        })
    }

    async fn watch(&self, namespace: &str, resource_version: &str) -> Result<WatchStream<R>> {
        let from: u64 = resource_version
            .parse()
            .map_err(|_| Error::bookmark_expired(resource_version))?;

        // Subscribe under the lock so no event falls between backlog and live.
        let state = self.state.read().await;
        if from < state.compacted_through {
            return Err(Error::bookmark_expired(resource_version));
        }
        let live = self.live.subscribe();
        let backlog = state
            .history
            .iter()
            .filter(|(version, _, resource)| *version > from && in_namespace(namespace, &resource.key()))
            .cloned()
            .collect();
        drop(state);

        let initial = WatchState {
            namespace: namespace.to_string(),
            backlog,
            live,
            disconnect: self.disconnect.subscribe(),
            last_delivered: from,
            finished: false,
        };
        Ok(futures::stream::unfold(initial, next_item).boxed())
    }

    async fn get(&self, key: &ResourceKey) -> Result<R> {
        self.state
            .read()
            .await
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))
    }

    async fn create(&self, mut resource: R) -> Result<R> {
        let key = resource.key();
        let mut state = self.state.write().await;
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                key: key.to_string(),
            });
        }

        state.version = state.version.saturating_add(1);
        let meta = resource.metadata_mut();
        meta.resource_version = Some(state.version.to_string());
        meta.uid = Some(ulid::Ulid::new().to_string());
        meta.creation_timestamp = Some(Utc::now());

        state.objects.insert(key, resource.clone());
        self.record(&mut state, EventKind::Added, &resource);
        Ok(resource)
    }

    async fn patch_status(
        &self,
        key: &ResourceKey,
        resource_version: &str,
        status: &R::Status,
    ) -> Result<R> {
        let mut state = self.state.write().await;
        if state.pending_conflicts > 0 {
            state.pending_conflicts = state.pending_conflicts.saturating_sub(1);
            return Err(Error::conflict(key, "injected conflict"));
        }

        let next_version = state.version.saturating_add(1);
        let resource = state
            .objects
            .get_mut(key)
            .ok_or_else(|| Error::not_found(key))?;
        if resource.resource_version() != Some(resource_version) {
            return Err(Error::conflict(
                key,
                format!(
                    "expected version {resource_version}, found {}",
                    resource.resource_version().unwrap_or("none")
                ),
            ));
        }

        resource.set_status(status.clone());
        resource.metadata_mut().resource_version = Some(next_version.to_string());
        let updated = resource.clone();

        state.version = next_version;
        state
            .status_writes
            .entry(key.clone())
            .or_default()
            .push(status.clone());
        self.record(&mut state, EventKind::Modified, &updated);
        Ok(updated)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let mut state = self.state.write().await;
        let mut resource = state
            .objects
            .remove(key)
            .ok_or_else(|| Error::not_found(key))?;

        state.version = state.version.saturating_add(1);
        resource.metadata_mut().resource_version = Some(state.version.to_string());
        self.record(&mut state, EventKind::Deleted, &resource);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use dprof_resources::{AlgorithmClass, ObjectMeta, ProfilingRequest, ProfilingRequestSpec};

    use super::*;

    fn request(name: &str) -> ProfilingRequest {
        ProfilingRequest::new(
            ObjectMeta::new("default", name),
            ProfilingRequestSpec::new(AlgorithmClass::Sorting, "bubble_sort"),
        )
    }

    #[tokio::test]
    async fn test_create_assigns_version_and_uid() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let store = InMemoryResourceStore::new();
        let created = store.create(request("a")).await?;
        assert_eq!(created.resource_version(), Some("1"));
        assert!(created.metadata.uid.is_some());
        assert!(store.create(request("a")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_patch_status_checks_version() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let store = InMemoryResourceStore::new();
        let created = store.create(request("a")).await?;
        let key = created.key();

        let updated = store.patch_status(&key, "1", &Default::default()).await?;
        assert_eq!(updated.resource_version(), Some("2"));

        let stale = store.patch_status(&key, "1", &Default::default()).await;
        assert!(matches!(stale, Err(Error::Conflict { .. })));
        assert_eq!(store.status_writes(&key).await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let store = InMemoryResourceStore::new();
        let created = store.create(request("a")).await?;
        store.inject_conflicts(1).await;

        let first = store.patch_status(&created.key(), "1", &Default::default()).await;
        assert!(first.is_err_and(|e| e.is_conflict()));
        store.patch_status(&created.key(), "1", &Default::default()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_compacted_bookmark_expires() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let store: InMemoryResourceStore<ProfilingRequest> = InMemoryResourceStore::new();
        store.create(request("a")).await?;
        store.create(request("b")).await?;
        store.compact().await;

        assert!(matches!(
            store.watch("", "1").await,
            Err(Error::BookmarkExpired { .. })
        ));
        assert!(store.watch("", "2").await.is_ok());
        Ok(())
    }
}
