//! Kubernetes-style REST client for custom resources.
//!
//! Speaks the custom-resource API of a cluster: list, newline-delimited JSON
//! watch with bookmarks, get, create, merge-patch on the status subresource
//! and delete.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use dprof_resources::{API_GROUP, API_VERSION, ResourceKey, ResourceObject};

use crate::error::{Error, Result};
use crate::store::{EventKind, ResourceList, ResourceStore, StreamItem, WatchEvent, WatchStream};

const MERGE_PATCH: &str = "application/merge-patch+json";

/// Connection settings for [`HttpResourceStore`].
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Base URL of the API server.
    pub api_url: Url,
    /// Bearer token sent with every request.
    pub token: Option<String>,
    /// PEM bundle of an extra trusted CA.
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Timeout for non-watch requests.
    pub request_timeout: Duration,
    /// Server-side timeout requested for each watch connection.
    pub watch_timeout: Duration,
}

impl HttpStoreConfig {
    /// Defaults for the given API server.
    pub const fn new(api_url: Url) -> Self {
        Self {
            api_url,
            token: None,
            ca_cert_pem: None,
            request_timeout: Duration::from_secs(30),
            watch_timeout: Duration::from_secs(290),
        }
    }

    /// Set the bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Trust an extra CA certificate.
    #[must_use]
    pub fn with_ca_cert(mut self, pem: Vec<u8>) -> Self {
        self.ca_cert_pem = Some(pem);
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Deserialize)]
struct ListMeta {
    #[serde(default, rename = "resourceVersion")]
    resource_version: String,
}

#[derive(Deserialize)]
#[serde(bound = "R: ResourceObject")]
struct ListBody<R> {
    #[serde(default = "Vec::new")]
    items: Vec<R>,
    metadata: ListMeta,
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

#[derive(Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

/// Resource store backed by a Kubernetes-compatible API server.
pub struct HttpResourceStore<R> {
    client: Client,
    config: HttpStoreConfig,
    _kind: PhantomData<fn() -> R>,
}

impl<R: ResourceObject> HttpResourceStore<R> {
    /// Build a client for one resource kind.
    pub fn new(config: HttpStoreConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(pem) = &config.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            _kind: PhantomData,
        })
    }

    fn collection_url(&self, namespace: &str) -> String {
        let base = self.config.api_url.as_str().trim_end_matches('/');
        if namespace.is_empty() {
            format!("{base}/apis/{API_GROUP}/{API_VERSION}/{}", R::PLURAL)
        } else {
            format!(
                "{base}/apis/{API_GROUP}/{API_VERSION}/namespaces/{namespace}/{}",
                R::PLURAL
            )
        }
    }

    fn object_url(&self, key: &ResourceKey) -> String {
        format!("{}/{}", self.collection_url(&key.namespace), key.name)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, key: &str) -> Result<Response> {
        let response = self
            .authorize(request)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        check_status(response, key).await
    }
}

async fn check_status(response: Response, key: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => Error::not_found(key),
        StatusCode::CONFLICT => Error::conflict(key, body),
        StatusCode::GONE => Error::bookmark_expired(body),
        _ => Error::Http {
            status: status.as_u16(),
            body,
        },
    })
}

fn parse_line<R: ResourceObject>(line: &[u8]) -> Result<StreamItem<R>> {
    let raw: RawWatchEvent = serde_json::from_slice(line)?;
    let kind = match raw.kind.as_str() {
        "ADDED" => EventKind::Added,
        "MODIFIED" => EventKind::Modified,
        "DELETED" => EventKind::Deleted,
        "BOOKMARK" => {
            let version = raw
                .object
                .pointer("/metadata/resourceVersion")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| Error::InvalidResponse("bookmark without resourceVersion".into()))?;
            return Ok(StreamItem::Bookmark(version.to_string()));
        }
        "ERROR" => {
            let status: ApiStatus = serde_json::from_value(raw.object)?;
            return Err(if status.code == 410 {
                Error::bookmark_expired(status.message)
            } else {
                Error::Stream(format!("{} {}", status.code, status.message))
            });
        }
        other => {
            return Err(Error::InvalidResponse(format!(
                "unknown watch event type '{other}'"
            )));
        }
    };
    let resource: R = serde_json::from_value(raw.object)?;
    Ok(StreamItem::Event(WatchEvent::new(kind, resource)))
}

struct LineReader {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    finished: bool,
}

impl LineReader {
    /// Next complete line, or the trailing partial line once the body ends.
    async fn next_line(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some(Ok(line));
            }
            if self.finished {
                if self.buffer.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                return Some(Ok(std::mem::take(&mut self.buffer)));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    self.buffer.clear();
                    return Some(Err(Error::Stream(e.to_string())));
                }
                None => self.finished = true,
            }
        }
    }
}

fn ndjson_stream<R: ResourceObject>(response: Response) -> WatchStream<R> {
    let reader = LineReader {
        body: response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed(),
        buffer: Vec::new(),
        finished: false,
    };
    futures::stream::unfold(reader, |mut reader| async move {
        let item = match reader.next_line().await? {
            Ok(line) => parse_line::<R>(&line),
            Err(e) => Err(e),
        };
        if item.is_err() {
            // Nothing after an error item is trustworthy.
            reader.finished = true;
            reader.buffer.clear();
        }
        Some((item, reader))
    })
    .boxed()
}

#[async_trait]
impl<R: ResourceObject> ResourceStore<R> for HttpResourceStore<R> {
    async fn list(&self, namespace: &str) -> Result<ResourceList<R>> {
        let url = self.collection_url(namespace);
        let response = self.send(self.client.get(&url), &url).await?;
        let body: ListBody<R> = response.json().await?;
        debug!(kind = R::KIND, count = body.items.len(), "listed resources");
        Ok(ResourceList {
            items: body.items,
            resource_version: body.metadata.resource_version,
        })
    }

    async fn watch(&self, namespace: &str, resource_version: &str) -> Result<WatchStream<R>> {
        let url = self.collection_url(namespace);
        let server_timeout = self.config.watch_timeout.as_secs().max(1);
        let request = self
            .authorize(self.client.get(&url))
            .query(&[
                ("watch", "1"),
                ("allowWatchBookmarks", "true"),
                ("resourceVersion", resource_version),
            ])
            .query(&[("timeoutSeconds", server_timeout)])
            .timeout(self.config.watch_timeout.saturating_add(self.config.request_timeout));

        let response = check_status(request.send().await?, &url).await?;
        debug!(kind = R::KIND, resource_version, "watch connected");
        Ok(ndjson_stream(response))
    }

    async fn get(&self, key: &ResourceKey) -> Result<R> {
        let response = self
            .send(self.client.get(self.object_url(key)), &key.to_string())
            .await?;
        Ok(response.json().await?)
    }

    async fn create(&self, resource: R) -> Result<R> {
        let key = resource.key();
        let mut body = serde_json::to_value(&resource)?;
        if let Some(object) = body.as_object_mut() {
            object.insert(
                "apiVersion".to_string(),
                format!("{API_GROUP}/{API_VERSION}").into(),
            );
            object.insert("kind".to_string(), R::KIND.into());
        }

        let request = self.client.post(self.collection_url(&key.namespace)).json(&body);
        let response = self.send(request, &key.to_string()).await.map_err(|e| match e {
            Error::Conflict { key, .. } => Error::AlreadyExists { key },
            other => other,
        })?;
        Ok(response.json().await?)
    }

    async fn patch_status(
        &self,
        key: &ResourceKey,
        resource_version: &str,
        status: &R::Status,
    ) -> Result<R> {
        let body = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        let request = self
            .client
            .patch(format!("{}/status", self.object_url(key)))
            .header(reqwest::header::CONTENT_TYPE, MERGE_PATCH)
            .body(serde_json::to_vec(&body)?);

        let response = self.send(request, &key.to_string()).await;
        if let Err(Error::Conflict { .. }) = &response {
            warn!(resource = %key, resource_version, "status patch conflict");
        }
        Ok(response?.json().await?)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        self.send(self.client.delete(self.object_url(key)), &key.to_string())
            .await?;
        Ok(())
    }
}
