//! Resource store trait and watch event types.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use dprof_resources::{ResourceKey, ResourceObject};

use crate::error::Result;

/// Kind of change carried by a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "Added"),
            Self::Modified => write!(f, "Modified"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

/// A change to one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent<R> {
    pub kind: EventKind,
    pub resource: R,
}

impl<R: ResourceObject> WatchEvent<R> {
    /// Create a new event.
    pub const fn new(kind: EventKind, resource: R) -> Self {
        Self { kind, resource }
    }

    /// Identity of the changed resource.
    pub fn key(&self) -> ResourceKey {
        self.resource.key()
    }
}

/// One item of a raw watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem<R> {
    /// A resource changed.
    Event(WatchEvent<R>),
    /// The stream is consistent up to this version; nothing else changed.
    Bookmark(String),
}

/// Snapshot returned by a list call.
#[derive(Debug, Clone)]
pub struct ResourceList<R> {
    pub items: Vec<R>,
    /// Version to resume watching from.
    pub resource_version: String,
}

/// Stream of watch items, ending when the server closes the connection.
pub type WatchStream<R> = BoxStream<'static, Result<StreamItem<R>>>;

/// Versioned store of one resource kind with change notifications.
///
/// An empty namespace means every namespace.
#[async_trait]
pub trait ResourceStore<R: ResourceObject>: Send + Sync {
    /// List every resource with the version the list is consistent at.
    async fn list(&self, namespace: &str) -> Result<ResourceList<R>>;

    /// Stream changes strictly after `resource_version`.
    ///
    /// Fails with `BookmarkExpired` when the version is too old to resume.
    async fn watch(&self, namespace: &str, resource_version: &str) -> Result<WatchStream<R>>;

    /// Read one resource.
    async fn get(&self, key: &ResourceKey) -> Result<R>;

    /// Create a resource.
    async fn create(&self, resource: R) -> Result<R>;

    /// Replace the status subtree if the resource is still at `resource_version`.
    async fn patch_status(
        &self,
        key: &ResourceKey,
        resource_version: &str,
        status: &R::Status,
    ) -> Result<R>;

    /// Delete a resource.
    async fn delete(&self, key: &ResourceKey) -> Result<()>;
}
