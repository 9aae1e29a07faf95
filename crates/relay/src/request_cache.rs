//! Per-request-id idempotency: single-flight coalescing plus a bounded TTL
//! cache of successful responses.
//!
//! Mirrors the original relay's `RequestCache`. The in-flight map holds a
//! completion primitive (`Notify`), never the future doing the work, so a
//! late joiner can observe completion independently of whichever task
//! happens to be driving `execute_fn`. The produced response is handed to
//! late joiners through a short-lived `pending_results` map rather than
//! through the completion primitive itself, so the primary completion path
//! can always clean its own entry up deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_proto::ErrorInfo;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ErrorInfo>,
}

struct CacheEntry {
    response: CachedResponse,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

struct InFlight {
    done: Arc<Notify>,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, InFlight>,
    pending_results: HashMap<String, CachedResponse>,
}

pub struct RequestCache {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl RequestCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                pending_results: HashMap::new(),
            }),
            ttl,
        }
    }

    /// Runs `execute_fn` for `request_id` exactly once concurrently: a cache
    /// hit returns immediately, a second concurrent caller for the same id
    /// waits for the first to finish and shares its response, and only a
    /// successful response is cached.
    pub async fn handle_request<F, Fut>(&self, request_id: &str, execute_fn: F) -> CachedResponse
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CachedResponse>,
    {
        loop {
            enum Action {
                Hit(CachedResponse),
                Wait(Arc<Notify>),
                Run,
            }

            let action = {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.entries.get(request_id) {
                    if !entry.is_expired(self.ttl) {
                        Action::Hit(entry.response.clone())
                    } else {
                        inner.entries.remove(request_id);
                        Action::Run
                    }
                } else if let Some(in_flight) = inner.in_flight.get(request_id) {
                    Action::Wait(in_flight.done.clone())
                } else {
                    inner.in_flight.insert(
                        request_id.to_string(),
                        InFlight {
                            done: Arc::new(Notify::new()),
                        },
                    );
                    Action::Run
                }
            };

            match action {
                Action::Hit(response) => return response,
                Action::Wait(notify) => {
                    notify.notified().await;
                    let mut inner = self.inner.lock().await;
                    if let Some(response) = inner.pending_results.remove(request_id) {
                        return response;
                    }
                    if let Some(entry) = inner.entries.get(request_id) {
                        return entry.response.clone();
                    }
                    // The primary invocation errored out; retry as the new primary.
                    continue;
                }
                Action::Run => {
                    let response = execute_fn().await;

                    let mut inner = self.inner.lock().await;
                    if response.success {
                        inner.entries.insert(
                            request_id.to_string(),
                            CacheEntry {
                                response: response.clone(),
                                created_at: Instant::now(),
                            },
                        );
                    }
                    inner.pending_results.insert(request_id.to_string(), response.clone());
                    if let Some(in_flight) = inner.in_flight.remove(request_id) {
                        in_flight.done.notify_waiters();
                    }
                    return response;
                }
            }
        }
    }

    pub async fn get_cached(&self, request_id: &str) -> Option<CachedResponse> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .get(request_id)
            .filter(|e| !e.is_expired(self.ttl))
            .map(|e| e.response.clone())
    }

    pub async fn is_pending(&self, request_id: &str) -> bool {
        self.inner.lock().await.in_flight.contains_key(request_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
    }

    async fn sweep(&self) {
        let mut inner = self.inner.lock().await;
        let ttl = self.ttl;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(ttl));
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
    }

    /// Runs the periodic sweep until `shutdown` fires, sleeping `ttl/2`
    /// between passes.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let interval = self.ttl / 2;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.sweep().await,
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_identical_request_does_not_re_execute() {
        let cache = RequestCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            CachedResponse {
                success: true,
                data: Some(serde_json::json!({"x": 1})),
                error: None,
            }
        };

        let first = cache.handle_request("r1", || run(calls.clone())).await;
        let second = cache.handle_request("r1", || run(calls.clone())).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.data, second.data);
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce_into_one_execution() {
        let cache = Arc::new(RequestCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .handle_request("shared", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        CachedResponse {
                            success: true,
                            data: Some(serde_json::json!({"ok": true})),
                            error: None,
                        }
                    })
                    .await
            }));
        }

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_responses_are_not_cached() {
        let cache = RequestCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            cache
                .handle_request("fails", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    CachedResponse {
                        success: false,
                        data: None,
                        error: None,
                    }
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.get_cached("fails").await.is_none());
    }
}
