//! `RelayServer`: wires the registry, request cache, and pending-command
//! table together and owns the accept loop's lifecycle (start/stop).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_config::RelayConfig;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info};

use crate::dispatch::CommandOutcome;
use crate::reload_oracle::{NoopReloadOracle, ReloadOracle};
use crate::request_cache::RequestCache;
use crate::registry::InstanceRegistry;

/// Mapping from request-id to the completion slot a `COMMAND_RESULT` (or
/// timeout, or instance loss) eventually resolves. Only the dispatch path
/// writes into this map; only the dispatch path removes from it.
pub type PendingCommands = Mutex<HashMap<String, tokio::sync::oneshot::Sender<CommandOutcome>>>;

pub struct RelayServer {
    pub config: RelayConfig,
    pub registry: Arc<InstanceRegistry>,
    pub request_cache: Arc<RequestCache>,
    pub pending_commands: PendingCommands,
    pub reload_oracle: Box<dyn ReloadOracle>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Self::new_with_reload_oracle(config, Box::new(NoopReloadOracle))
    }

    pub fn new_with_reload_oracle(config: RelayConfig, reload_oracle: Box<dyn ReloadOracle>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            request_cache: Arc::new(RequestCache::new(Duration::from_secs(config.cache.ttl_seconds))),
            registry: Arc::new(InstanceRegistry::new()),
            pending_commands: Mutex::new(HashMap::new()),
            reload_oracle,
            config,
            shutdown_tx,
        })
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Binds the listener and runs the accept loop until a shutdown signal
    /// (ctrl-c or terminate) arrives, then tears everything down:
    /// stop accepting, close every instance connection (flushing their
    /// queues with `INSTANCE_DISCONNECTED`), stop the cache sweeper.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.listen.host, self.config.listen.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "relay listening");

        let sweeper = {
            let cache = self.request_cache.clone();
            let shutdown = self.subscribe_shutdown();
            tokio::spawn(cache.run_sweeper(shutdown))
        };

        let mut shutdown = self.subscribe_shutdown();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => { error!(error = %e, "accept failed"); continue; }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = crate::dispatch::handle_connection(stream, server).await {
                            tracing::debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("shutdown signal received, draining");
                    break;
                }
            }
        }

        self.registry.close_all().await;
        for (_, slot) in self.pending_commands.lock().await.drain() {
            let _ = slot.send(CommandOutcome::Error(relay_proto::ErrorInfo::from_code(
                relay_proto::ErrorCode::InstanceDisconnected,
            )));
        }
        let _ = sweeper.await;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Installs the system signal handlers and triggers `shutdown()` on
    /// interrupt or terminate, the way the original daemon's signal handling
    /// worked.
    pub fn spawn_signal_handler(self: &Arc<Self>) {
        let server = self.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            server.shutdown();
        });
    }
}
