//! Connection dispatch: accept, classify, and run either the long-lived
//! instance-connection path or a one-shot client request.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_proto::{
    read_frame, write_frame, ErrorCode, ErrorInfo, InstanceStatus, InstancesData, Message, PROTOCOL_VERSION,
};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::registry::{InstanceHandle, QueuedCommand, RegisterRequest, ResolveError};
use crate::request_cache::CachedResponse;
use crate::server::RelayServer;

const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of running a single dispatched `COMMAND` through to its
/// `COMMAND_RESULT`, a timeout, or an internal failure.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Success(Option<Value>),
    Error(ErrorInfo),
}

impl CommandOutcome {
    fn into_cached(self) -> CachedResponse {
        match self {
            CommandOutcome::Success(data) => CachedResponse {
                success: true,
                data,
                error: None,
            },
            CommandOutcome::Error(info) => CachedResponse {
                success: false,
                data: None,
                error: Some(info),
            },
        }
    }
}

/// Accepts one connection, reads its classifying first frame, and routes it.
pub async fn handle_connection(stream: TcpStream, server: Arc<RelayServer>) -> anyhow::Result<()> {
    let (mut read_half, write_half) = stream.into_split();

    let first: Message = match tokio::time::timeout(CLASSIFY_TIMEOUT, read_frame(&mut read_half)).await {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            debug!(error = %e, "failed to read classifying frame");
            return Ok(());
        }
        Err(_) => {
            debug!("classification deadline exceeded");
            return Ok(());
        }
    };

    match first {
        Message::Register { .. } => {
            handle_instance_connection(read_half, write_half, first, server).await;
        }
        Message::Request { .. } | Message::ListInstances { .. } | Message::SetDefault { .. } => {
            let mut write_half = write_half;
            let reply = handle_client_message(first, &server).await;
            let _ = write_frame(&mut write_half, &reply).await;
        }
        other => {
            debug!(?other, "unrecognized first frame, closing");
        }
    }
    Ok(())
}

/// The agent-connection lifecycle: register, ack, spawn heartbeat, then loop
/// reading frames until the peer goes quiet or disconnects.
async fn handle_instance_connection(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    write_half: tokio::net::tcp::OwnedWriteHalf,
    register: Message,
    server: Arc<RelayServer>,
) {
    let Message::Register {
        protocol_version,
        instance_id,
        project_name,
        unity_version,
        capabilities,
        ..
    } = register
    else {
        unreachable!("caller only routes Register here");
    };

    if protocol_version != PROTOCOL_VERSION {
        let reply = Message::registered(
            false,
            server.config.heartbeat.interval_ms,
            Some(ErrorInfo::from_code(ErrorCode::ProtocolVersionMismatch)),
        );
        let mut write_half = write_half;
        let _ = write_frame(&mut write_half, &reply).await;
        return;
    }

    let handle = server
        .registry
        .register(RegisterRequest {
            id: instance_id.clone(),
            project_name,
            agent_version: unity_version,
            capabilities: capabilities.into_iter().collect::<HashSet<_>>(),
            sink: write_half,
            queue_enabled: server.config.queue.enabled,
            queue_max_size: server.config.queue.max_size,
        })
        .await;

    let registered = Message::registered(true, server.config.heartbeat.interval_ms, None);
    if handle.send(&registered).await.is_err() {
        server.registry.unregister(&instance_id).await;
        return;
    }
    info!(instance_id = %instance_id, "instance registered");

    let heartbeat_handle = tokio::spawn(crate::heartbeat::run(
        handle.clone(),
        server.config.heartbeat.clone(),
        server.subscribe_shutdown(),
    ));

    let read_timeout = Duration::from_millis(server.config.heartbeat.timeout_ms);
    loop {
        tokio::select! {
            _ = handle.disconnected() => {
                debug!(instance_id = %instance_id, "instance handle forced disconnect (takeover)");
                break;
            }
            frame = tokio::time::timeout(read_timeout, read_frame::<_, Message>(&mut read_half)) => {
                match frame {
                    Ok(Ok(Message::Status { status, .. })) => {
                        handle.set_status(status).await;
                    }
                    Ok(Ok(Message::CommandResult { id, success, data, error, .. })) => {
                        let mut pending = server.pending_commands.lock().await;
                        if let Some(slot) = pending.remove(&id) {
                            let outcome = if success {
                                CommandOutcome::Success(data)
                            } else {
                                CommandOutcome::Error(error.unwrap_or_else(|| ErrorInfo::from_code(ErrorCode::InternalError)))
                            };
                            let _ = slot.send(outcome);
                        } else {
                            warn!(id = %id, "late COMMAND_RESULT, dropping");
                        }
                    }
                    Ok(Ok(Message::Pong { .. })) => {
                        handle.signal_pong().await;
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        debug!(instance_id = %instance_id, error = %e, "instance connection read error");
                        break;
                    }
                    Err(_) => {
                        if server.registry.heartbeat_timeout_check(&instance_id, server.config.heartbeat.timeout_ms).await {
                            warn!(instance_id = %instance_id, "heartbeat timed out, disconnecting");
                            break;
                        }
                    }
                }
            }
        }
    }

    heartbeat_handle.abort();
    let grace_ms = server.config.heartbeat.reload_timeout_ms;
    let was_reloading = handle.status().await == InstanceStatus::Reloading
        || server.reload_oracle.is_reloading(&instance_id);
    server
        .registry
        .disconnect_with_grace(&instance_id, grace_ms, was_reloading)
        .await;
}

/// One-shot handling for `REQUEST`, `LIST_INSTANCES`, and `SET_DEFAULT`.
async fn handle_client_message(msg: Message, server: &Arc<RelayServer>) -> Message {
    match msg {
        Message::Request {
            id,
            instance,
            command,
            params,
            timeout_ms,
            ..
        } => {
            let cache = server.request_cache.clone();
            let server = server.clone();
            let request_id = id.clone();
            let response = cache
                .handle_request(&id, || {
                    run_client_request(request_id, instance, command, params, timeout_ms, server)
                })
                .await;
            translate_cached(&id, response)
        }
        Message::ListInstances { id, .. } => {
            let instances = server.registry.list_all().await;
            Message::Instances {
                ts: chrono::Utc::now().timestamp_millis(),
                id,
                success: true,
                data: InstancesData { instances },
            }
        }
        Message::SetDefault { id, instance, .. } => {
            if server.registry.set_default(&instance).await {
                Message::response_ok(id, None)
            } else {
                Message::error(id, ErrorInfo::from_code(ErrorCode::InstanceNotFound))
            }
        }
        other => {
            warn!(?other, "unexpected message routed to client handler");
            Message::error("", ErrorInfo::from_code(ErrorCode::ProtocolError))
        }
    }
}

fn translate_cached(id: &str, response: CachedResponse) -> Message {
    if response.success {
        Message::response_ok(id, response.data)
    } else {
        let error = response.error.unwrap_or_else(|| ErrorInfo::from_code(ErrorCode::InternalError));
        Message::error(id, error)
    }
}

/// Implements the ready-wait / capability-check / busy-queue / dispatch
/// sequence for a single client `REQUEST`. Runs inside the request cache's
/// single-flight section. `request_id` is the client's own `REQUEST.id`,
/// reused verbatim as the outbound `COMMAND.id` so the agent's
/// `COMMAND_RESULT` correlates back to the request that caused it.
async fn run_client_request(
    request_id: String,
    instance_query: Option<String>,
    command: String,
    params: Value,
    timeout_ms: u64,
    server: Arc<RelayServer>,
) -> CachedResponse {
    let budget = Duration::from_millis(server.config.command.ready_wait_budget_ms);
    let poll = Duration::from_millis(server.config.command.ready_wait_poll_ms);
    let started = Instant::now();

    let instance = loop {
        match server.registry.get_for_request(instance_query.as_deref()).await {
            Err(ResolveError::Ambiguous) => {
                return error_response(ErrorCode::AmbiguousInstance);
            }
            Err(ResolveError::NotFound) => {
                if instance_query.is_some() {
                    return error_response(ErrorCode::InstanceNotFound);
                }
                // No query and no default: the agent may still be reconnecting.
            }
            Ok(None) => {
                if instance_query.is_some() {
                    return error_response(ErrorCode::InstanceNotFound);
                }
            }
            Ok(Some(handle)) => {
                let status = handle.status().await;
                if !matches!(status, InstanceStatus::Reloading | InstanceStatus::Disconnected) {
                    break handle;
                }
            }
        }

        if started.elapsed() >= budget {
            return error_response(ErrorCode::InstanceNotFound);
        }
        tokio::time::sleep(poll).await;
    };

    if !instance.capabilities.is_empty() && !instance.capabilities.contains(&command) {
        let caps: Vec<_> = instance.capabilities.iter().cloned().collect();
        return CachedResponse {
            success: false,
            data: None,
            error: Some(ErrorInfo::new(
                ErrorCode::CapabilityNotSupported,
                format!("command '{command}' not in capability set {caps:?}"),
            )),
        };
    }

    if instance.status().await == InstanceStatus::Reloading {
        return error_response(ErrorCode::InstanceReloading);
    }

    if instance.status().await == InstanceStatus::Busy {
        if !instance.queue_enabled {
            return error_response(ErrorCode::InstanceBusy);
        }
        let (tx, rx) = oneshot::channel();
        let queued = QueuedCommand {
            request_id: request_id.clone(),
            command: command.clone(),
            params: params.clone(),
            timeout_ms,
            completion: tx,
        };
        if !instance.enqueue(queued).await {
            return error_response(ErrorCode::QueueFull);
        }
        return match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(outcome)) => outcome.into_cached(),
            _ => error_response(ErrorCode::Timeout),
        };
    }

    let outcome = dispatch_single(instance.clone(), &server, request_id, command, params, timeout_ms).await;
    pump_queue(instance, &server).await;
    outcome.into_cached()
}

fn error_response(code: ErrorCode) -> CachedResponse {
    CachedResponse {
        success: false,
        data: None,
        error: Some(ErrorInfo::from_code(code)),
    }
}

/// Dispatches a single `COMMAND` to an already-resolved, non-busy instance:
/// claims the `BUSY` token, emits the frame, waits for the correlated
/// `COMMAND_RESULT`, then releases the token. Used both for the direct path
/// and for commands drained from an instance's queue.
async fn dispatch_single(
    instance: Arc<InstanceHandle>,
    server: &Arc<RelayServer>,
    request_id: String,
    command: String,
    params: Value,
    timeout_ms: u64,
) -> CommandOutcome {
    instance.set_status(InstanceStatus::Busy).await;

    let (tx, rx) = oneshot::channel();
    server.pending_commands.lock().await.insert(request_id.clone(), tx);

    let frame = Message::Command {
        ts: chrono::Utc::now().timestamp_millis(),
        id: request_id.clone(),
        command,
        params,
        timeout_ms,
    };

    let outcome = if instance.send(&frame).await.is_err() {
        CommandOutcome::Error(ErrorInfo::from_code(ErrorCode::InternalError))
    } else {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => CommandOutcome::Error(ErrorInfo::from_code(ErrorCode::InternalError)),
            Err(_) => CommandOutcome::Error(ErrorInfo::from_code(ErrorCode::Timeout)),
        }
    };

    server.pending_commands.lock().await.remove(&request_id);
    if instance.status().await == InstanceStatus::Busy {
        instance.set_status(InstanceStatus::Ready).await;
    }
    outcome
}

/// Drains an instance's FIFO queue, skipping any entry whose waiter has
/// already given up (its own timeout fired and dropped the receiver).
async fn pump_queue(instance: Arc<InstanceHandle>, server: &Arc<RelayServer>) {
    while let Some(queued) = instance.dequeue().await {
        if queued.completion.is_closed() {
            continue;
        }
        let outcome = dispatch_single(
            instance.clone(),
            server,
            queued.request_id,
            queued.command,
            queued.params,
            queued.timeout_ms,
        )
        .await;
        let _ = queued.completion.send(outcome);
    }
}
