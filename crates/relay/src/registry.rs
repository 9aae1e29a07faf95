//! Instance registry: who's connected, who's default, and how to find one by query.
//!
//! Mirrors the original relay's `InstanceRegistry`: a mutex-guarded id→record
//! map plus a single nullable default id and a grace-period table for
//! instances that disconnect mid-reload. The per-instance record itself
//! (`InstanceHandle`) is an `Arc` so the heartbeat task and the dispatch
//! task that owns its connection can share it without re-acquiring the
//! registry lock for routine status and queue operations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use relay_proto::{ErrorCode, ErrorInfo, InstanceStatus, InstanceSummary, Message};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatch::CommandOutcome;

/// A command waiting in an instance's FIFO queue because it was `BUSY` when
/// the request arrived.
pub struct QueuedCommand {
    pub request_id: String,
    pub command: String,
    pub params: serde_json::Value,
    pub timeout_ms: u64,
    pub completion: tokio::sync::oneshot::Sender<CommandOutcome>,
}

struct InstanceState {
    status: InstanceStatus,
    reloading_since: Option<Instant>,
    last_heartbeat: Instant,
    queue: VecDeque<QueuedCommand>,
}

/// A registered instance and everything needed to talk to it.
pub struct InstanceHandle {
    pub id: String,
    pub project_name: String,
    pub agent_version: String,
    pub capabilities: HashSet<String>,
    pub registered_at: DateTime<Utc>,
    pub queue_enabled: bool,
    pub queue_max_size: usize,
    state: Mutex<InstanceState>,
    sink: Mutex<OwnedWriteHalf>,
    pending_pong: Mutex<Option<Arc<Notify>>>,
    /// Signaled when a takeover or shutdown should force this instance's
    /// connection-handling task to stop reading and tear down.
    disconnect: Notify,
}

impl InstanceHandle {
    pub async fn status(&self) -> InstanceStatus {
        self.state.lock().await.status
    }

    pub async fn is_available(&self) -> bool {
        matches!(self.status().await, InstanceStatus::Ready | InstanceStatus::Busy)
    }

    pub async fn set_status(&self, status: InstanceStatus) {
        let mut state = self.state.lock().await;
        if status == InstanceStatus::Reloading {
            state.reloading_since.get_or_insert(Instant::now());
        } else {
            state.reloading_since = None;
        }
        state.status = status;
    }

    pub async fn reloading_since(&self) -> Option<Instant> {
        self.state.lock().await.reloading_since
    }

    pub async fn touch_heartbeat(&self) {
        self.state.lock().await.last_heartbeat = Instant::now();
    }

    pub async fn last_heartbeat(&self) -> Instant {
        self.state.lock().await.last_heartbeat
    }

    pub async fn queue_size(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Attempts to enqueue a command. Returns `false` (queue full) without
    /// mutating state if at capacity.
    pub async fn enqueue(&self, cmd: QueuedCommand) -> bool {
        let mut state = self.state.lock().await;
        if state.queue.len() >= self.queue_max_size {
            return false;
        }
        state.queue.push_back(cmd);
        true
    }

    pub async fn dequeue(&self) -> Option<QueuedCommand> {
        self.state.lock().await.queue.pop_front()
    }

    /// Flushes the queue, completing every waiter with `error`.
    pub async fn flush_queue(&self, code: ErrorCode) {
        let mut state = self.state.lock().await;
        while let Some(cmd) = state.queue.pop_front() {
            let _ = cmd.completion.send(CommandOutcome::Error(ErrorInfo::from_code(code)));
        }
    }

    /// Registers a fresh pending-pong token, replacing any prior one (there
    /// should never be one outstanding — the heartbeat loop is single-flight).
    pub async fn arm_pong(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.pending_pong.lock().await = Some(notify.clone());
        notify
    }

    pub async fn disarm_pong(&self) {
        *self.pending_pong.lock().await = None;
    }

    /// Signals the current pending pong, if any. Extra or out-of-order
    /// `PONG`s with no outstanding token are silently ignored.
    pub async fn signal_pong(&self) {
        if let Some(notify) = self.pending_pong.lock().await.as_ref() {
            notify.notify_one();
        }
    }

    pub async fn send(&self, msg: &Message) -> Result<(), relay_proto::FrameError> {
        let mut sink = self.sink.lock().await;
        relay_proto::write_frame(&mut *sink, msg).await
    }

    /// Forces this instance's connection-handling task to stop and tear down,
    /// without waiting for the peer to notice. Used by takeover and shutdown.
    pub fn force_disconnect(&self) {
        self.disconnect.notify_waiters();
    }

    /// Resolves once `force_disconnect` is called. The connection-handling
    /// loop selects on this alongside its next frame read.
    pub async fn disconnected(&self) {
        self.disconnect.notified().await;
    }

    pub async fn summary(&self, is_default: bool) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            project_name: self.project_name.clone(),
            agent_version: self.agent_version.clone(),
            status: self.status().await,
            is_default,
            capabilities: self.capabilities.iter().cloned().collect(),
            queue_size: self.queue_size().await,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no instance matched query")]
    NotFound,
    #[error("query matched more than one instance")]
    Ambiguous,
}

pub struct RegisterRequest {
    pub id: String,
    pub project_name: String,
    pub agent_version: String,
    pub capabilities: HashSet<String>,
    pub sink: OwnedWriteHalf,
    pub queue_enabled: bool,
    pub queue_max_size: usize,
}

/// Id→record map, default selection, and grace-period bookkeeping.
///
/// Lookups only take the read lock; mutation (`register`, `unregister`,
/// grace-period transitions) takes the write lock. Per-instance status and
/// queue state live behind `InstanceHandle`'s own mutex so routine heartbeat
/// and dispatch traffic never contends on the registry lock at all.
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Arc<InstanceHandle>>>,
    default_instance_id: Mutex<Option<String>>,
    grace_period_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    was_default: Mutex<HashMap<String, bool>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            default_instance_id: Mutex::new(None),
            grace_period_tasks: Mutex::new(HashMap::new()),
            was_default: Mutex::new(HashMap::new()),
        }
    }

    /// Registers (or takes over) an instance. Cancels any pending grace-period
    /// timer for `req.id` and restores default status if that timer's record
    /// used to be the default.
    pub async fn register(&self, req: RegisterRequest) -> Arc<InstanceHandle> {
        if let Some(task) = self.grace_period_tasks.lock().await.remove(&req.id) {
            task.abort();
        }
        let restore_default = self.was_default.lock().await.remove(&req.id).unwrap_or(false);

        let handle = Arc::new(InstanceHandle {
            id: req.id.clone(),
            project_name: req.project_name,
            agent_version: req.agent_version,
            capabilities: req.capabilities,
            registered_at: Utc::now(),
            queue_enabled: req.queue_enabled,
            queue_max_size: req.queue_max_size,
            state: Mutex::new(InstanceState {
                status: InstanceStatus::Ready,
                reloading_since: None,
                last_heartbeat: Instant::now(),
                queue: VecDeque::new(),
            }),
            sink: Mutex::new(req.sink),
            pending_pong: Mutex::new(None),
            disconnect: Notify::new(),
        });

        let mut instances = self.instances.write().await;
        if let Some(old) = instances.insert(req.id.clone(), handle.clone()) {
            info!(instance_id = %req.id, "takeover: replacing existing connection");
            old.flush_queue(ErrorCode::InstanceDisconnected).await;
            old.force_disconnect();
        }
        drop(instances);

        let mut default = self.default_instance_id.lock().await;
        if restore_default || default.is_none() {
            *default = Some(req.id);
        }

        handle
    }

    /// Removes a live record outright and re-elects a default if needed.
    pub async fn unregister(&self, id: &str) {
        let removed = self.instances.write().await.remove(id);
        if let Some(handle) = removed {
            handle.flush_queue(ErrorCode::InstanceDisconnected).await;
            handle.force_disconnect();
        }
        self.reelect_default_if(id).await;
    }

    /// Peer loss for an instance that may be reloading. `was_reloading` is
    /// the caller's own determination — in-memory `STATUS`, the reload
    /// oracle, or both — and is trusted as-is rather than re-derived here,
    /// so an oracle-only signal (no `STATUS{reloading}` ever seen) still
    /// grants the grace period. If reloading and `grace_ms > 0`, removes the
    /// live record but keeps a grace-period timer running that, on expiry,
    /// fully unregisters and re-elects the default. A `register` for the
    /// same id before expiry cancels the timer.
    pub async fn disconnect_with_grace(self: &Arc<Self>, id: &str, grace_ms: u64, was_reloading: bool) {
        if !was_reloading || grace_ms == 0 {
            self.unregister(id).await;
            return;
        }

        let was_default = self.default_instance_id.lock().await.as_deref() == Some(id);
        let removed = self.instances.write().await.remove(id);
        if let Some(handle) = removed {
            handle.flush_queue(ErrorCode::InstanceDisconnected).await;
        }
        self.was_default.lock().await.insert(id.to_string(), was_default);

        let id_owned = id.to_string();
        let registry = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(grace_ms)).await;
            registry.grace_period_tasks.lock().await.remove(&id_owned);
            registry.was_default.lock().await.remove(&id_owned);
            registry.reelect_default_if(&id_owned).await;
            warn!(instance_id = %id_owned, "grace period expired, instance unregistered");
        });
        self.grace_period_tasks.lock().await.insert(id.to_string(), task);
    }

    async fn reelect_default_if(&self, id: &str) {
        let mut default = self.default_instance_id.lock().await;
        if default.as_deref() == Some(id) {
            let instances = self.instances.read().await;
            *default = instances.keys().next().cloned();
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<InstanceHandle>> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn get_default(&self) -> Option<Arc<InstanceHandle>> {
        let id = self.default_instance_id.lock().await.clone()?;
        self.get(&id).await
    }

    pub async fn is_default(&self, id: &str) -> bool {
        self.default_instance_id.lock().await.as_deref() == Some(id)
    }

    pub async fn set_default(&self, id: &str) -> bool {
        if !self.instances.read().await.contains_key(id) {
            return false;
        }
        *self.default_instance_id.lock().await = Some(id.to_string());
        true
    }

    /// Four-stage match: exact id, exact project name, id path-suffix, then
    /// project-name prefix. Each stage short-circuits on exactly one match
    /// and is ambiguous on more than one.
    pub async fn resolve(&self, query: &str) -> Result<Arc<InstanceHandle>, ResolveError> {
        let instances = self.instances.read().await;

        if let Some(handle) = instances.get(query) {
            return Ok(handle.clone());
        }

        let by_project: Vec<_> = instances.values().filter(|h| h.project_name == query).collect();
        match by_project.len() {
            0 => {}
            1 => return Ok(by_project[0].clone()),
            _ => return Err(ResolveError::Ambiguous),
        }

        let suffix_slash = format!("/{query}");
        let suffix_backslash = format!("\\{query}");
        let by_suffix: Vec<_> = instances
            .values()
            .filter(|h| h.id.ends_with(&suffix_slash) || h.id.ends_with(&suffix_backslash))
            .collect();
        match by_suffix.len() {
            0 => {}
            1 => return Ok(by_suffix[0].clone()),
            _ => return Err(ResolveError::Ambiguous),
        }

        let by_prefix: Vec<_> = instances.values().filter(|h| h.project_name.starts_with(query)).collect();
        match by_prefix.len() {
            0 => Err(ResolveError::NotFound),
            1 => Ok(by_prefix[0].clone()),
            _ => Err(ResolveError::Ambiguous),
        }
    }

    /// `resolve(query)` if given, else the current default.
    pub async fn get_for_request(&self, query: Option<&str>) -> Result<Option<Arc<InstanceHandle>>, ResolveError> {
        match query {
            Some(q) => self.resolve(q).await.map(Some),
            None => Ok(self.get_default().await),
        }
    }

    /// If the instance has gone quiet for longer than its timeout (30 s while
    /// reloading, else `timeout_ms`), marks it `DISCONNECTED` and reports
    /// `true`.
    pub async fn heartbeat_timeout_check(&self, id: &str, timeout_ms: u64) -> bool {
        let Some(handle) = self.get(id).await else {
            return false;
        };
        let effective_timeout = if handle.status().await == InstanceStatus::Reloading {
            Duration::from_secs(30)
        } else {
            Duration::from_millis(timeout_ms)
        };
        if handle.last_heartbeat().await.elapsed() > effective_timeout {
            handle.set_status(InstanceStatus::Disconnected).await;
            true
        } else {
            false
        }
    }

    pub async fn list_all(&self) -> Vec<InstanceSummary> {
        let instances = self.instances.read().await;
        let default_id = self.default_instance_id.lock().await.clone();
        let mut out = Vec::with_capacity(instances.len());
        for handle in instances.values() {
            out.push(handle.summary(Some(handle.id.as_str()) == default_id.as_deref()).await);
        }
        out
    }

    /// Closes every live connection, flushing queues with
    /// `INSTANCE_DISCONNECTED`. Used on graceful shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.instances.read().await.keys().cloned().collect();
        for id in ids {
            self.unregister(&id).await;
        }
        for (_, task) in self.grace_period_tasks.lock().await.drain() {
            task.abort();
        }
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_capabilities(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn loopback_write_half() -> OwnedWriteHalf {
        use tokio::net::{TcpListener, TcpStream};
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let _client = connector.await.unwrap();
        server.into_split().1
    }

    #[tokio::test]
    async fn register_sets_default_when_none_set() {
        let registry = InstanceRegistry::new();
        let sink = loopback_write_half().await;
        registry
            .register(RegisterRequest {
                id: "/p/A".into(),
                project_name: "A".into(),
                agent_version: "1.0".into(),
                capabilities: fake_capabilities(&["echo"]),
                sink,
                queue_enabled: false,
                queue_max_size: 10,
            })
            .await;
        assert!(registry.is_default("/p/A").await);
    }

    #[tokio::test]
    async fn resolve_ambiguous_on_suffix_collision() {
        let registry = InstanceRegistry::new();
        for id in ["/u/demo/ProjA", "/u/other/ProjA"] {
            let sink = loopback_write_half().await;
            registry
                .register(RegisterRequest {
                    id: id.into(),
                    project_name: "ProjA".into(),
                    agent_version: "1.0".into(),
                    capabilities: HashSet::new(),
                    sink,
                    queue_enabled: false,
                    queue_max_size: 10,
                })
                .await;
        }
        let err = registry.resolve("ProjA").await.unwrap_err();
        assert!(matches!(err, ResolveError::Ambiguous));

        let exact = registry.resolve("/u/demo/ProjA").await.unwrap();
        assert_eq!(exact.id, "/u/demo/ProjA");
    }

    #[tokio::test]
    async fn unregister_reelects_default() {
        let registry = InstanceRegistry::new();
        let sink_a = loopback_write_half().await;
        registry
            .register(RegisterRequest {
                id: "a".into(),
                project_name: "A".into(),
                agent_version: "1.0".into(),
                capabilities: HashSet::new(),
                sink: sink_a,
                queue_enabled: false,
                queue_max_size: 10,
            })
            .await;
        let sink_b = loopback_write_half().await;
        registry
            .register(RegisterRequest {
                id: "b".into(),
                project_name: "B".into(),
                agent_version: "1.0".into(),
                capabilities: HashSet::new(),
                sink: sink_b,
                queue_enabled: false,
                queue_max_size: 10,
            })
            .await;
        registry.unregister("a").await;
        assert!(registry.is_default("b").await);
    }
}
