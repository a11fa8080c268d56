//! Request deduplication guard
//!
//! Detects structurally identical concurrent submissions (same account,
//! method, path, and body) and lets only the first one execute. The
//! duplicates await the original's outcome and replay its response,
//! tagged with an `x-deduplicated` marker. A failed original releases
//! its duplicates to execute normally: the guard fails open, never
//! closed.
//!
//! The guard is a process-wide service object injected into the router,
//! not ambient global state. Correctness under the multi-threaded
//! runtime comes from compare-and-swap registration under one mutex:
//! single write wins, others replay.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::Stream;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Largest replayable response body; bigger bodies fail open
const MAX_CAPTURE_BYTES: usize = 2 * 1024 * 1024;

/// How long a settled entry lingers so trailing duplicates still replay
const SETTLED_GRACE: Duration = Duration::from_secs(1);

/// A captured response, replayed verbatim to duplicates
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// How the original request settled
#[derive(Debug, Clone)]
enum Outcome {
    Completed(StoredResponse),
    Failed,
}

struct PendingEntry {
    request_id: String,
    registered_at: Instant,
    outcome: watch::Receiver<Option<Outcome>>,
}

struct DedupInner {
    ttl: Duration,
    sweep_probability: f64,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

/// Process-wide deduplication guard
#[derive(Clone)]
pub struct DedupGuard {
    inner: Arc<DedupInner>,
}

/// Result of registering a signature
pub enum Registration {
    /// This request is the first; it must execute and settle the handle
    Fresh(CompletionHandle),
    /// An identical request already ran; replay its response
    Duplicate {
        response: StoredResponse,
        original_request_id: String,
    },
}

impl DedupGuard {
    pub fn new(ttl: Duration, sweep_probability: f64) -> Self {
        Self {
            inner: Arc::new(DedupInner {
                ttl,
                sweep_probability,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Signature over the request identity: account, method, path, body
    pub fn signature(account: &str, method: &str, path: &str, body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(account.as_bytes());
        hasher.update(b":");
        hasher.update(method.as_bytes());
        hasher.update(b":");
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(body);
        format!("{:x}", hasher.finalize())
    }

    /// Register a signature, either claiming it or awaiting the original
    ///
    /// Loops internally: when an awaited original fails, the entry is
    /// torn down and registration retried, so exactly one of the
    /// released duplicates becomes the new original.
    pub async fn register(&self, signature: &str) -> Registration {
        loop {
            let waiting = {
                let mut pending = match self.inner.pending.lock() {
                    Ok(guard) => guard,
                    // A poisoned map must never block the handler.
                    Err(poisoned) => poisoned.into_inner(),
                };

                match pending.get(signature) {
                    Some(entry) if entry.registered_at.elapsed() < self.inner.ttl => {
                        Some((entry.request_id.clone(), entry.outcome.clone()))
                    }
                    _ => {
                        let request_id = uuid::Uuid::new_v4().to_string();
                        let (tx, rx) = watch::channel(None);
                        pending.insert(
                            signature.to_string(),
                            PendingEntry {
                                request_id: request_id.clone(),
                                registered_at: Instant::now(),
                                outcome: rx,
                            },
                        );
                        drop(pending);

                        self.maybe_sweep();

                        return Registration::Fresh(CompletionHandle {
                            inner: Arc::clone(&self.inner),
                            signature: signature.to_string(),
                            request_id,
                            tx: Some(tx),
                        });
                    }
                }
            };

            let (original_id, mut rx) = waiting.expect("checked above");
            let settled = rx.wait_for(|outcome| outcome.is_some()).await;

            match settled {
                Ok(outcome) => match outcome.clone().expect("waited for Some") {
                    Outcome::Completed(response) => {
                        metrics::increment_counter!("dedup_replays_total");
                        return Registration::Duplicate {
                            response,
                            original_request_id: original_id,
                        };
                    }
                    Outcome::Failed => {
                        self.remove_if(signature, &original_id);
                        continue;
                    }
                },
                // Sender dropped without settling: the original died.
                Err(_) => {
                    self.remove_if(signature, &original_id);
                    continue;
                }
            }
        }
    }

    /// Remove an entry only if it still belongs to the given request
    fn remove_if(&self, signature: &str, request_id: &str) {
        let mut pending = match self.inner.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if pending
            .get(signature)
            .is_some_and(|e| e.request_id == request_id)
        {
            pending.remove(signature);
        }
    }

    /// Occasionally drop entries older than the TTL
    fn maybe_sweep(&self) {
        if rand::random::<f64>() >= self.inner.sweep_probability {
            return;
        }
        let ttl = self.inner.ttl;
        let mut pending = match self.inner.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        pending.retain(|_, entry| entry.registered_at.elapsed() < ttl);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

/// Settles the original request's outcome
///
/// Dropping the handle without calling [`CompletionHandle::complete`]
/// publishes a failure, releasing any waiting duplicates.
pub struct CompletionHandle {
    inner: Arc<DedupInner>,
    signature: String,
    request_id: String,
    tx: Option<watch::Sender<Option<Outcome>>>,
}

impl CompletionHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Publish the captured response and schedule entry removal
    pub fn complete(mut self, response: StoredResponse) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Outcome::Completed(response)));
            // Keep the settled entry around briefly so duplicates that
            // arrive right after completion still replay.
            let inner = Arc::clone(&self.inner);
            let signature = self.signature.clone();
            let request_id = self.request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SETTLED_GRACE).await;
                let mut pending = match inner.pending.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if pending
                    .get(&signature)
                    .is_some_and(|e| e.request_id == request_id)
                {
                    pending.remove(&signature);
                }
            });
        }
    }

    /// Publish a failure, releasing duplicates to execute
    pub fn fail(mut self) {
        self.fail_in_place();
    }

    fn fail_in_place(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Outcome::Failed));
            let mut pending = match self.inner.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if pending
                .get(&self.signature)
                .is_some_and(|e| e.request_id == self.request_id)
            {
                pending.remove(&self.signature);
            }
        }
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        self.fail_in_place();
    }
}

// ---------------------------------------------------------------------------
// Axum layer
// ---------------------------------------------------------------------------

/// State for the dedup middleware layer
#[derive(Clone)]
pub struct DedupLayerState {
    pub guard: DedupGuard,
    /// Cap when buffering request bodies for signature computation
    pub max_body_bytes: usize,
}

/// Middleware applying the guard to mutating requests
///
/// Read-only methods bypass the guard entirely. Any internal fault
/// (unreadable body, poisoned map) degrades to running the handler as
/// if no duplicate existed.
pub async fn dedup_middleware(
    State(state): State<DedupLayerState>,
    request: Request,
    next: Next,
) -> Response {
    if matches!(
        *request.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    ) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let account = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous");
    let signature = DedupGuard::signature(
        account,
        parts.method.as_str(),
        parts.uri.path(),
        &bytes,
    );

    let request = Request::from_parts(parts, Body::from(bytes));

    match state.guard.register(&signature).await {
        Registration::Duplicate {
            response,
            original_request_id,
        } => {
            let mut replay = Response::builder()
                .status(response.status)
                .body(Body::from(response.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            *replay.headers_mut() = response.headers;
            replay
                .headers_mut()
                .insert("x-deduplicated", HeaderValue::from_static("true"));
            if let Ok(id) = HeaderValue::from_str(&original_request_id) {
                replay.headers_mut().insert("x-original-request-id", id);
            }
            replay
        }
        Registration::Fresh(handle) => {
            let mut response = next.run(request).await;
            if let Ok(id) = HeaderValue::from_str(handle.request_id()) {
                response.headers_mut().insert("x-request-id", id);
            }

            if response.status().is_server_error() {
                handle.fail();
                return response;
            }

            // Tee the body: stream to the client while capturing for
            // replay; the outcome publishes when the body finishes.
            let (parts, body) = response.into_parts();
            let tee = TeeBody::new(body, parts.status, parts.headers.clone(), handle);
            Response::from_parts(parts, Body::from_stream(tee))
        }
    }
}

/// Body wrapper that captures streamed chunks for duplicate replay
///
/// Publishes a completed outcome when the inner body ends, a failed one
/// on error, overflow, or early drop (the handle's drop behavior).
struct TeeBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, axum::Error>> + Send>>,
    status: StatusCode,
    headers: HeaderMap,
    captured: Vec<u8>,
    overflowed: bool,
    handle: Option<CompletionHandle>,
}

impl TeeBody {
    fn new(body: Body, status: StatusCode, headers: HeaderMap, handle: CompletionHandle) -> Self {
        Self {
            inner: Box::pin(body.into_data_stream()),
            status,
            headers,
            captured: Vec::new(),
            overflowed: false,
            handle: Some(handle),
        }
    }
}

impl Stream for TeeBody {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !self.overflowed {
                    if self.captured.len() + chunk.len() <= MAX_CAPTURE_BYTES {
                        self.captured.extend_from_slice(&chunk);
                    } else {
                        self.overflowed = true;
                        self.captured.clear();
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(handle) = self.handle.take() {
                    handle.fail();
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(handle) = self.handle.take() {
                    if self.overflowed {
                        handle.fail();
                    } else {
                        handle.complete(StoredResponse {
                            status: self.status,
                            headers: self.headers.clone(),
                            body: Bytes::from(std::mem::take(&mut self.captured)),
                        });
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> DedupGuard {
        DedupGuard::new(Duration::from_secs(30), 0.0)
    }

    fn stored(body: &str) -> StoredResponse {
        StoredResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn test_signature_is_stable_and_sensitive() {
        let a = DedupGuard::signature("acct1", "POST", "/api/messages", b"hello");
        let b = DedupGuard::signature("acct1", "POST", "/api/messages", b"hello");
        let c = DedupGuard::signature("acct2", "POST", "/api/messages", b"hello");
        let d = DedupGuard::signature("acct1", "POST", "/api/messages", b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[tokio::test]
    async fn test_first_registration_is_fresh() {
        let guard = guard();
        match guard.register("sig").await {
            Registration::Fresh(handle) => {
                assert!(!handle.request_id().is_empty());
            }
            _ => panic!("expected fresh registration"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_replays_completed_response() {
        let guard = guard();
        let handle = match guard.register("sig").await {
            Registration::Fresh(h) => h,
            _ => panic!("expected fresh"),
        };

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.register("sig").await })
        };

        // Give the duplicate time to start waiting, then settle.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.complete(stored("the reply"));

        match waiter.await.unwrap() {
            Registration::Duplicate {
                response,
                original_request_id,
            } => {
                assert_eq!(response.body, Bytes::from("the reply"));
                assert!(!original_request_id.is_empty());
            }
            _ => panic!("expected duplicate replay"),
        }
    }

    #[tokio::test]
    async fn test_failed_original_releases_duplicate() {
        let guard = guard();
        let handle = match guard.register("sig").await {
            Registration::Fresh(h) => h,
            _ => panic!("expected fresh"),
        };

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.register("sig").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.fail();

        // The released duplicate becomes the new original.
        match waiter.await.unwrap() {
            Registration::Fresh(_) => {}
            _ => panic!("expected the duplicate to be released"),
        }
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_duplicate() {
        let guard = guard();
        let handle = match guard.register("sig").await {
            Registration::Fresh(h) => h,
            _ => panic!("expected fresh"),
        };

        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.register("sig").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(handle);

        match waiter.await.unwrap() {
            Registration::Fresh(_) => {}
            _ => panic!("expected fail-open on drop"),
        }
    }

    #[tokio::test]
    async fn test_only_one_of_many_concurrent_registrations_is_fresh() {
        let guard = guard();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            tasks.push(tokio::spawn(async move { guard.register("sig").await }));
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        // Settle whichever one won.
        let mut fresh = 0;
        let mut handles = Vec::new();
        let mut pending = Vec::new();
        for task in tasks {
            if task.is_finished() {
                match task.await.unwrap() {
                    Registration::Fresh(h) => {
                        fresh += 1;
                        handles.push(h);
                    }
                    _ => panic!("nothing settled yet, no duplicate should resolve"),
                }
            } else {
                pending.push(task);
            }
        }
        assert_eq!(fresh, 1, "exactly one concurrent registration wins");

        handles.pop().unwrap().complete(stored("done"));
        for task in pending {
            match task.await.unwrap() {
                Registration::Duplicate { response, .. } => {
                    assert_eq!(response.body, Bytes::from("done"));
                }
                _ => panic!("expected duplicates to replay"),
            }
        }
    }

    #[tokio::test]
    async fn test_expired_entry_is_replaced() {
        let guard = DedupGuard::new(Duration::from_millis(10), 0.0);
        let _stale = match guard.register("sig").await {
            Registration::Fresh(h) => h,
            _ => panic!("expected fresh"),
        };

        tokio::time::sleep(Duration::from_millis(25)).await;
        match guard.register("sig").await {
            Registration::Fresh(_) => {}
            _ => panic!("an expired entry must not shadow new requests"),
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_entries() {
        let guard = DedupGuard::new(Duration::from_millis(5), 1.0);
        let handle = match guard.register("old").await {
            Registration::Fresh(h) => h,
            _ => panic!("expected fresh"),
        };
        // Keep the handle alive but let the entry age out.
        tokio::time::sleep(Duration::from_millis(15)).await;

        match guard.register("new").await {
            Registration::Fresh(_) => {}
            _ => panic!("expected fresh"),
        }
        assert_eq!(guard.pending_len(), 1, "stale entry swept on registration");
        drop(handle);
    }
}
