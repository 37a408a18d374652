//! Restartable resource watcher.
//!
//! Turns the raw, fallible watch protocol of a [`ResourceStore`] into an
//! endless ordered sequence of [`WatchEvent`]s:
//!
//! - resumes from the last bookmark when a stream ends or fails
//! - re-lists when the bookmark has expired, synthesizing `Added` for every
//!   existing resource and `Deleted` for every cached one that vanished
//! - backs off exponentially with jitter on errors
//!
//! Stream errors are never fatal; the watcher only stops on shutdown or when
//! the receiving side goes away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dprof_resources::{ResourceKey, ResourceObject};

use crate::error::{Error, Result};
use crate::store::{EventKind, ResourceStore, StreamItem, WatchEvent, WatchStream};

/// Watcher tuning.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Namespace to watch; empty for all.
    pub namespace: String,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Reconnect delay cap.
    pub max_backoff: Duration,
    /// Force a full re-list this often; `None` disables it.
    pub resync_interval: Option<Duration>,
}

impl WatcherConfig {
    /// Defaults for one namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            resync_interval: Some(Duration::from_secs(300)),
        }
    }

    /// Set the backoff bounds.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set or disable the periodic re-list.
    #[must_use]
    pub const fn with_resync_interval(mut self, interval: Option<Duration>) -> Self {
        self.resync_interval = interval;
        self
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Exponential backoff for `attempt`, capped at `max`, with up to half of it
/// replaced by random jitter.
pub fn calculate_backoff(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let base_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    let capped = base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max_ms);
    let half = capped / 2;
    let jitter = if half == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=half)
    };
    Duration::from_millis(capped.saturating_sub(half).saturating_add(jitter))
}

enum StreamEnd {
    /// The server closed the stream.
    Closed,
    /// The bookmark expired or a resync is due; re-list.
    Relist,
    /// The stream failed; back off and resume.
    Failed(Error),
    /// Shutdown was requested or nobody is listening any more.
    Stop,
}

/// Watches one resource kind and forwards events to a channel.
pub struct ResourceWatcher<R: ResourceObject> {
    store: Arc<dyn ResourceStore<R>>,
    config: WatcherConfig,
    known: HashMap<ResourceKey, R>,
}

impl<R: ResourceObject> ResourceWatcher<R> {
    /// Create a watcher over `store`.
    pub fn new(store: Arc<dyn ResourceStore<R>>, config: WatcherConfig) -> Self {
        Self {
            store,
            config,
            known: HashMap::new(),
        }
    }

    /// Run until `shutdown` flips to true or `events` is closed.
    pub async fn run(
        mut self,
        events: mpsc::Sender<WatchEvent<R>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(kind = R::KIND, namespace = %self.config.namespace, "watcher started");
        let mut bookmark: Option<String> = None;
        let mut attempt: u32 = 0;
        let mut next_resync = self.next_resync_deadline();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let version = match bookmark.take() {
                Some(version) => version,
                None => match self.relist(&events).await {
                    Ok(Some(version)) => {
                        next_resync = self.next_resync_deadline();
                        attempt = 0;
                        version
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(kind = R::KIND, error = %e, attempt, "list failed, backing off");
                        if !self.back_off(attempt, &mut shutdown).await {
                            break;
                        }
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                },
            };

            let stream = match self.store.watch(&self.config.namespace, &version).await {
                Ok(stream) => stream,
                Err(Error::BookmarkExpired { .. }) => {
                    info!(kind = R::KIND, version = %version, "bookmark expired, re-listing");
                    continue;
                }
                Err(e) => {
                    warn!(kind = R::KIND, error = %e, attempt, "watch failed, backing off");
                    bookmark = Some(version);
                    if !self.back_off(attempt, &mut shutdown).await {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            let mut position = version;
            let mut delivered = false;
            let end = self
                .consume(stream, &events, &mut shutdown, &mut position, &mut delivered, next_resync)
                .await;
            if delivered {
                attempt = 0;
            }
            match end {
                StreamEnd::Closed => {
                    debug!(kind = R::KIND, version = %position, "watch stream closed, resuming");
                    attempt = 0;
                    bookmark = Some(position);
                }
                StreamEnd::Relist => {}
                StreamEnd::Failed(e) => {
                    warn!(kind = R::KIND, error = %e, attempt, "watch stream failed, backing off");
                    bookmark = Some(position);
                    if !self.back_off(attempt, &mut shutdown).await {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                }
                StreamEnd::Stop => break,
            }
        }
        info!(kind = R::KIND, "watcher stopped");
    }

    fn next_resync_deadline(&self) -> Option<Instant> {
        self.config
            .resync_interval
            .and_then(|interval| Instant::now().checked_add(interval))
    }

    /// Full list; emits `Added` for everything present and `Deleted` for
    /// cached resources that disappeared. `Ok(None)` means the receiver is gone.
    async fn relist(&mut self, events: &mpsc::Sender<WatchEvent<R>>) -> Result<Option<String>> {
        let list = self.store.list(&self.config.namespace).await?;
        debug!(kind = R::KIND, count = list.items.len(), version = %list.resource_version, "re-listed");

        let mut fresh: HashMap<ResourceKey, R> = HashMap::with_capacity(list.items.len());
        for resource in list.items {
            fresh.insert(resource.key(), resource.clone());
            if events
                .send(WatchEvent::new(EventKind::Added, resource))
                .await
                .is_err()
            {
                return Ok(None);
            }
        }

        let stale = std::mem::replace(&mut self.known, fresh);
        for (key, resource) in stale {
            if self.known.contains_key(&key) {
                continue;
            }
            info!(resource = %key, "resource vanished while disconnected");
            if events
                .send(WatchEvent::new(EventKind::Deleted, resource))
                .await
                .is_err()
            {
                return Ok(None);
            }
        }

        Ok(Some(list.resource_version))
    }

    async fn consume(
        &mut self,
        mut stream: WatchStream<R>,
        events: &mpsc::Sender<WatchEvent<R>>,
        shutdown: &mut watch::Receiver<bool>,
        position: &mut String,
        delivered: &mut bool,
        resync_at: Option<Instant>,
    ) -> StreamEnd {
        let resync = async {
            match resync_at {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(resync);

        loop {
            let item = tokio::select! {
                _ = shutdown.changed() => return StreamEnd::Stop,
                () = &mut resync => {
                    debug!(kind = R::KIND, "periodic resync");
                    return StreamEnd::Relist;
                }
                item = stream.next() => item,
            };

            if matches!(item, Some(Ok(_))) {
                *delivered = true;
            }
            match item {
                None => return StreamEnd::Closed,
                Some(Ok(StreamItem::Bookmark(version))) => *position = version,
                Some(Ok(StreamItem::Event(event))) => {
                    if let Some(version) = event.resource.resource_version() {
                        *position = version.to_string();
                    }
                    let key = event.key();
                    match event.kind {
                        EventKind::Added | EventKind::Modified => {
                            self.known.insert(key, event.resource.clone());
                        }
                        EventKind::Deleted => {
                            self.known.remove(&key);
                        }
                    }
                    if events.send(event).await.is_err() {
                        return StreamEnd::Stop;
                    }
                }
                Some(Err(Error::BookmarkExpired { .. })) => return StreamEnd::Relist,
                Some(Err(e)) => return StreamEnd::Failed(e),
            }
        }
    }

    /// Sleep for the backoff delay; false if shutdown arrived first.
    async fn back_off(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = calculate_backoff(attempt, self.config.initial_backoff, self.config.max_backoff);
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }
}
