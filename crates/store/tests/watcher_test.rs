//! Watcher behaviour against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use dprof_resources::{
    AlgorithmClass, ObjectMeta, ProfilingRequest, ProfilingRequestSpec, ResourceKey,
    ResourceObject,
};
use dprof_store::{
    Error, EventKind, InMemoryResourceStore, ResourceList, ResourceStore, ResourceWatcher,
    StreamItem, WatchEvent, WatchStream, WatcherConfig,
};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn request(name: &str) -> ProfilingRequest {
    ProfilingRequest::new(
        ObjectMeta::new("default", name),
        ProfilingRequestSpec::new(AlgorithmClass::Sorting, "bubble_sort"),
    )
}

fn fast_config() -> WatcherConfig {
    WatcherConfig::new("default")
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .with_resync_interval(None)
}

async fn next_event(
    rx: &mut mpsc::Receiver<WatchEvent<ProfilingRequest>>,
) -> Result<WatchEvent<ProfilingRequest>, Box<dyn std::error::Error>> {
    timeout(Duration::from_secs(2), rx.recv())
        .await?
        .ok_or_else(|| "watcher channel closed".into())
}

#[tokio::test]
async fn test_watch_resumes_from_bookmark() -> TestResult {
    let store = InMemoryResourceStore::new_arc();
    store.create(request("a")).await?;

    let mut stream = store.watch("default", "1").await?;
    store.create(request("b")).await?;

    let item = timeout(Duration::from_secs(1), stream.next()).await?;
    match item {
        Some(Ok(StreamItem::Event(event))) => {
            assert_eq!(event.kind, EventKind::Added);
            assert_eq!(event.resource.metadata.name, "b");
        }
        other => return Err(format!("unexpected item: {other:?}").into()),
    }
    Ok(())
}

#[tokio::test]
async fn test_disconnect_ends_streams() -> TestResult {
    let store: Arc<InMemoryResourceStore<ProfilingRequest>> = InMemoryResourceStore::new_arc();
    let mut stream = store.watch("", "0").await?;
    store.disconnect_watchers();
    let item = timeout(Duration::from_secs(1), stream.next()).await?;
    assert!(item.is_none());
    Ok(())
}

#[tokio::test]
async fn test_watcher_lists_then_follows() -> TestResult {
    let store = InMemoryResourceStore::new_arc();
    store.create(request("existing")).await?;

    let (tx, mut rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = ResourceWatcher::new(store.clone(), fast_config());
    let handle = tokio::spawn(watcher.run(tx, shutdown_rx));

    let first = next_event(&mut rx).await?;
    assert_eq!(first.kind, EventKind::Added);
    assert_eq!(first.resource.metadata.name, "existing");

    store.create(request("fresh")).await?;
    let second = next_event(&mut rx).await?;
    assert_eq!(second.resource.metadata.name, "fresh");

    store.delete(&ResourceKey::new("default", "existing")).await?;
    let third = next_event(&mut rx).await?;
    assert_eq!(third.kind, EventKind::Deleted);

    shutdown_tx.send(true)?;
    timeout(Duration::from_secs(2), handle).await??;
    Ok(())
}

#[tokio::test]
async fn test_watcher_reconnects_after_disconnect() -> TestResult {
    let store = InMemoryResourceStore::new_arc();
    let (tx, mut rx) = mpsc::channel(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(ResourceWatcher::new(store.clone(), fast_config()).run(tx, shutdown_rx));

    store.create(request("a")).await?;
    assert_eq!(next_event(&mut rx).await?.resource.metadata.name, "a");

    store.disconnect_watchers();
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.create(request("b")).await?;

    let event = next_event(&mut rx).await?;
    assert_eq!(event.resource.metadata.name, "b");
    assert_eq!(event.kind, EventKind::Added);
    Ok(())
}

#[tokio::test]
async fn test_expired_bookmark_synthesizes_deletes() -> TestResult {
    let store = InMemoryResourceStore::new_arc();
    store.create(request("keep")).await?;
    store.create(request("gone")).await?;

    let (tx, mut rx) = mpsc::channel(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(ResourceWatcher::new(store.clone(), fast_config()).run(tx, shutdown_rx));

    for _ in 0..2 {
        assert_eq!(next_event(&mut rx).await?.kind, EventKind::Added);
    }

    // Delete while the watcher is disconnected, then drop the history so its
    // bookmark can no longer be resumed.
    store.disconnect_watchers();
    store.delete(&ResourceKey::new("default", "gone")).await?;
    store.compact().await;

    let mut deleted = Vec::new();
    for _ in 0..3 {
        match timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(event)) if event.kind == EventKind::Deleted => {
                deleted.push(event.resource.key());
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    assert_eq!(deleted, vec![ResourceKey::new("default", "gone")]);
    Ok(())
}

#[tokio::test]
async fn test_watcher_stops_when_receiver_dropped() -> TestResult {
    let store = InMemoryResourceStore::new_arc();
    store.create(request("a")).await?;

    let (tx, rx) = mpsc::channel(1);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ResourceWatcher::new(store.clone(), fast_config()).run(tx, shutdown_rx));
    drop(rx);

    timeout(Duration::from_secs(2), handle).await??;
    Ok(())
}

#[tokio::test]
async fn test_namespace_filter() -> TestResult {
    let store = InMemoryResourceStore::new_arc();
    store
        .create(ProfilingRequest::new(
            ObjectMeta::new("other", "x"),
            ProfilingRequestSpec::new(AlgorithmClass::Sorting, "quick_sort"),
        ))
        .await?;
    store.create(request("y")).await?;

    let list = store.list("default").await?;
    assert_eq!(list.items.len(), 1);
    assert_eq!(list.items[0].key(), ResourceKey::new("default", "y"));
    assert_eq!(store.list("").await?.items.len(), 2);
    Ok(())
}

/// Every watch delivers one event and then fails.
struct FlakyStore {
    inner: Arc<InMemoryResourceStore<ProfilingRequest>>,
    connections: AtomicUsize,
}

#[async_trait]
impl ResourceStore<ProfilingRequest> for FlakyStore {
    async fn list(&self, namespace: &str) -> dprof_store::Result<ResourceList<ProfilingRequest>> {
        self.inner.list(namespace).await
    }

    async fn watch(
        &self,
        _namespace: &str,
        _resource_version: &str,
    ) -> dprof_store::Result<WatchStream<ProfilingRequest>> {
        let count = self.connections.fetch_add(1, Ordering::SeqCst);
        let mut changed = request("flaky");
        changed.metadata.resource_version = Some(count.saturating_add(1).to_string());
        let items = vec![
            Ok(StreamItem::Event(WatchEvent::new(EventKind::Modified, changed))),
            Err(Error::Stream("connection reset".to_string())),
        ];
        Ok(futures::stream::iter(items).boxed())
    }

    async fn get(&self, key: &ResourceKey) -> dprof_store::Result<ProfilingRequest> {
        self.inner.get(key).await
    }

    async fn create(&self, resource: ProfilingRequest) -> dprof_store::Result<ProfilingRequest> {
        self.inner.create(resource).await
    }

    async fn patch_status(
        &self,
        key: &ResourceKey,
        resource_version: &str,
        status: &<ProfilingRequest as ResourceObject>::Status,
    ) -> dprof_store::Result<ProfilingRequest> {
        self.inner.patch_status(key, resource_version, status).await
    }

    async fn delete(&self, key: &ResourceKey) -> dprof_store::Result<()> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn test_backoff_resets_after_stream_delivers() -> TestResult {
    let store = Arc::new(FlakyStore {
        inner: InMemoryResourceStore::new_arc(),
        connections: AtomicUsize::new(0),
    });
    let config = WatcherConfig::new("default")
        .with_backoff(Duration::from_millis(20), Duration::from_secs(1))
        .with_resync_interval(None);

    let (tx, mut rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(ResourceWatcher::new(store.clone(), config).run(tx, shutdown_rx));
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown_tx.send(true)?;
    timeout(Duration::from_secs(2), handle).await??;
    drain.abort();

    // Growing delays (20ms, 40ms, .. 1s) would allow fewer than ten connections.
    let connections = store.connections.load(Ordering::SeqCst);
    assert!(connections >= 20, "only {connections} watch connections in 1s");
    Ok(())
}
