//! Per-session registry of in-flight requests.
//!
//! One entry per live `request_id`, created on request headers (or lazily by
//! an early body chunk) and destroyed on a blocking decision, cancellation,
//! completion, or stream loss. The registry is owned by its session handler
//! and never shared across sessions.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::request::Request;

/// Cached upstream response head for a request.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct RequestEntry {
    /// None while the entry is headerless (chunk arrived before headers)
    request: Option<Arc<Request>>,
    request_body: BytesMut,
    response: Option<ResponseHead>,
    response_body: BytesMut,
    cancel: CancellationToken,
}

/// Tracks every in-flight request of one session.
///
/// Writes serialise through a single lock; each critical section is short
/// and never held across a suspension point.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    entries: Mutex<HashMap<u64, RequestEntry>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the entry for a request, returning its cancellation token.
    ///
    /// A duplicate open replaces the existing entry and fires its token so
    /// the prior in-flight callback observes cancellation.
    pub async fn open(&self, id: u64, request: Arc<Request>) -> CancellationToken {
        let cancel = request.cancellation();
        let entry = RequestEntry {
            request: Some(request),
            cancel: cancel.clone(),
            ..Default::default()
        };

        let mut entries = self.entries.lock().await;
        if let Some(old) = entries.insert(id, entry) {
            debug!(request_id = id, "replacing live request entry");
            old.cancel.cancel();
        }
        cancel
    }

    /// The cached request for an id, if headers have been seen.
    pub async fn request(&self, id: u64) -> Option<Arc<Request>> {
        self.entries
            .lock()
            .await
            .get(&id)
            .and_then(|e| e.request.clone())
    }

    /// Append a request body chunk. A chunk for an unknown id buffers into a
    /// fresh headerless entry.
    pub async fn append_request_chunk(&self, id: u64, data: &[u8]) {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(id).or_insert_with(|| {
            debug!(request_id = id, "body chunk before headers, buffering");
            RequestEntry::default()
        });
        entry.request_body.extend_from_slice(data);
    }

    /// Take the accumulated request body along with the cached request.
    ///
    /// Returns `None` if the id is unknown; the request is `None` for a
    /// headerless entry.
    pub async fn take_request_body(&self, id: u64) -> Option<(Option<Arc<Request>>, Bytes)> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id)?;
        Some((entry.request.clone(), entry.request_body.split().freeze()))
    }

    /// Cache the upstream response head and reset the response body buffer.
    /// Returns false if the id is unknown.
    pub async fn cache_response_head(&self, id: u64, head: ResponseHead) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.response = Some(head);
                entry.response_body.clear();
                true
            }
            None => false,
        }
    }

    pub async fn response_head(&self, id: u64) -> Option<ResponseHead> {
        self.entries
            .lock()
            .await
            .get(&id)
            .and_then(|e| e.response.clone())
    }

    /// Append a response body chunk; no-op for an unknown id.
    pub async fn append_response_chunk(&self, id: u64, data: &[u8]) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.response_body.extend_from_slice(data);
                true
            }
            None => {
                debug!(request_id = id, "response chunk for unknown request");
                false
            }
        }
    }

    /// Take the accumulated response body along with the cached request and
    /// response head.
    pub async fn take_response_body(
        &self,
        id: u64,
    ) -> Option<(Option<Arc<Request>>, Option<ResponseHead>, Bytes)> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id)?;
        Some((
            entry.request.clone(),
            entry.response.clone(),
            entry.response_body.split().freeze(),
        ))
    }

    /// Remove the entry without firing its cancellation token.
    pub async fn close(&self, id: u64) -> bool {
        self.entries.lock().await.remove(&id).is_some()
    }

    /// Fire the cancellation token for an id and remove its entry.
    /// The token fires before the entry is torn down.
    pub async fn cancel(&self, id: u64) -> bool {
        let entry = self.entries.lock().await.remove(&id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Fire every cancellation token and clear the registry, returning the
    /// ids that were live.
    pub async fn cancel_all(&self) -> Vec<u64> {
        let entries = std::mem::take(&mut *self.entries.lock().await);
        let mut ids = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            entry.cancel.cancel();
            ids.push(id);
        }
        ids
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, id: u64) -> bool {
        self.entries.lock().await.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestHeadersEvent;

    fn request(id: u64) -> Arc<Request> {
        Arc::new(Request::from_event(
            RequestHeadersEvent {
                request_id: id,
                method: "GET".to_string(),
                uri: format!("/{id}"),
                ..Default::default()
            },
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn chunks_accumulate_in_order() {
        let registry = RequestRegistry::new();
        registry.open(1, request(1)).await;

        registry.append_request_chunk(1, b"foo").await;
        registry.append_request_chunk(1, b"bar").await;

        let (req, body) = registry.take_request_body(1).await.unwrap();
        assert!(req.is_some());
        assert_eq!(&body[..], b"foobar");

        // The buffer is drained by take.
        let (_, body) = registry.take_request_body(1).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn chunk_before_headers_buffers_into_headerless_entry() {
        let registry = RequestRegistry::new();
        registry.append_request_chunk(7, b"early").await;

        let (req, body) = registry.take_request_body(7).await.unwrap();
        assert!(req.is_none());
        assert_eq!(&body[..], b"early");
    }

    #[tokio::test]
    async fn duplicate_open_cancels_the_prior_entry() {
        let registry = RequestRegistry::new();
        let first = registry.open(1, request(1)).await;
        assert!(!first.is_cancelled());

        let second = registry.open(1, request(1)).await;
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn cancel_fires_token_and_removes_entry() {
        let registry = RequestRegistry::new();
        let token = registry.open(3, request(3)).await;

        assert!(registry.cancel(3).await);
        assert!(token.is_cancelled());
        assert!(!registry.contains(3).await);
        assert!(!registry.cancel(3).await);
    }

    #[tokio::test]
    async fn close_releases_without_firing() {
        let registry = RequestRegistry::new();
        let token = registry.open(4, request(4)).await;

        assert!(registry.close(4).await);
        assert!(!token.is_cancelled());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn cancel_all_fires_every_token() {
        let registry = RequestRegistry::new();
        let t1 = registry.open(1, request(1)).await;
        let t2 = registry.open(2, request(2)).await;

        let mut ids = registry.cancel_all().await;
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn response_head_is_cached_per_request() {
        let registry = RequestRegistry::new();
        registry.open(5, request(5)).await;

        let cached = registry
            .cache_response_head(
                5,
                ResponseHead {
                    status: 200,
                    headers: HashMap::new(),
                },
            )
            .await;
        assert!(cached);

        registry.append_response_chunk(5, b"ok").await;
        let (req, head, body) = registry.take_response_body(5).await.unwrap();
        assert!(req.is_some());
        assert_eq!(head.unwrap().status, 200);
        assert_eq!(&body[..], b"ok");

        assert!(
            !registry
                .cache_response_head(
                    99,
                    ResponseHead {
                        status: 200,
                        headers: HashMap::new(),
                    },
                )
                .await
        );
    }
}
