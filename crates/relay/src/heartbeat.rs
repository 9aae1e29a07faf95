//! Single-outstanding-ping heartbeat loop, one task per connected instance.
//!
//! Never pipelines pings: a fresh pong token is armed immediately before
//! `PING` is sent and cleared immediately after the round resolves, so there
//! is at most one outstanding round-trip in flight at any time. Three
//! consecutive failures (timeout or send failure) end the loop, which the
//! caller interprets as peer loss and routes through the same teardown path
//! used for any other disconnect.

use std::sync::Arc;
use std::time::Duration;

use relay_config::HeartbeatConfig;
use relay_proto::{InstanceStatus, Message};
use tracing::{debug, warn};

use crate::registry::InstanceHandle;

/// Runs until three consecutive heartbeat rounds fail or `shutdown` fires.
/// Does not itself tear down the instance; the caller observes the loop
/// exiting and is responsible for teardown.
pub async fn run(
    instance: Arc<InstanceHandle>,
    config: HeartbeatConfig,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(config.interval_ms)) => {}
            _ = shutdown.recv() => {
                debug!(instance_id = %instance.id, "heartbeat loop stopped for shutdown");
                return;
            }
        }

        let timeout = if instance.status().await == InstanceStatus::Reloading {
            Duration::from_millis(config.reload_timeout_ms)
        } else {
            Duration::from_millis(config.timeout_ms)
        };

        let pong = instance.arm_pong().await;
        let sent = instance.send(&Message::ping()).await;

        let round_ok = if sent.is_err() {
            false
        } else {
            tokio::time::timeout(timeout, pong.notified()).await.is_ok()
        };
        instance.disarm_pong().await;

        if round_ok {
            consecutive_failures = 0;
        } else {
            consecutive_failures += 1;
            warn!(
                instance_id = %instance.id,
                consecutive_failures,
                "heartbeat round failed"
            );
            if consecutive_failures >= config.max_failures {
                warn!(instance_id = %instance.id, "heartbeat max failures reached, disconnecting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::net::{TcpListener, TcpStream};

    async fn fresh_instance() -> (Arc<InstanceHandle>, TcpStream) {
        use crate::registry::{InstanceRegistry, RegisterRequest};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = connector.await.unwrap();

        let registry = InstanceRegistry::new();
        let handle = registry
            .register(RegisterRequest {
                id: "x".into(),
                project_name: "X".into(),
                agent_version: "1.0".into(),
                capabilities: HashSet::new(),
                sink: server.into_split().1,
                queue_enabled: false,
                queue_max_size: 10,
            })
            .await;
        (handle, client)
    }

    #[tokio::test]
    async fn three_unanswered_pings_end_the_loop() {
        let (instance, client) = fresh_instance().await;
        // Drain pings but never reply, so every round times out.
        let mut reader = tokio::io::BufReader::new(client);
        tokio::spawn(async move {
            loop {
                use tokio::io::AsyncReadExt;
                let mut buf = [0u8; 4];
                if reader.read_exact(&mut buf).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(buf) as usize;
                let mut body = vec![0u8; len];
                if reader.read_exact(&mut body).await.is_err() {
                    break;
                }
            }
        });

        let config = HeartbeatConfig {
            interval_ms: 5,
            timeout_ms: 10,
            reload_timeout_ms: 30,
            max_failures: 3,
        };
        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        run(instance, config, rx).await;
        // run() returning is the assertion: the loop gave up after 3 failures.
    }
}
