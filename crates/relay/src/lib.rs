//! Relay daemon library: multiplexes CLI client requests to registered
//! editor instances over TCP.
//!
//! Leaves first: [`registry`] tracks who's connected; [`request_cache`]
//! deduplicates retried client requests; [`heartbeat`] keeps per-instance
//! liveness; [`dispatch`] ties it all together into a connection handler;
//! [`server`] owns the accept loop and graceful shutdown.

pub mod dispatch;
pub mod heartbeat;
pub mod registry;
pub mod reload_oracle;
pub mod request_cache;
pub mod server;

pub use server::RelayServer;
