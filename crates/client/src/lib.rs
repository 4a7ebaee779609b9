//! Resilient gRPC client engine.
//!
//! Bulwark wraps a unary gRPC transport and turns it into a reliable,
//! observable, self-healing dependency. Applications embed one
//! [`BulwarkClient`] per remote service; the engine manages connectivity,
//! retries transient failures, serves stale cached responses during
//! outages, and exposes health, metrics and lifecycle events.
//!
//! # Features
//!
//! - **Connection supervision**: lazy establishment, readiness gating,
//!   background health probing, reconnection with capped jittered backoff
//! - **Retrying calls**: per-attempt deadlines, wire-code classification,
//!   exponential backoff between attempts
//! - **Stale-while-unavailable caching**: bounded LRU with per-entry TTL,
//!   populated on success and served on terminal failure
//! - **Observability**: counters with cached snapshots, health reports,
//!   typed lifecycle events
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use bulwark_client::{BulwarkClient, CallOptions, ClientConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> bulwark_client::Result<()> {
//!     let config = ClientConfig::builder()
//!         .with_service_name("user-service")
//!         .with_grpc_url("http://users.internal:50051")
//!         .with_service_path("users.v1.UserService")
//!         .with_fallback_cache(true)
//!         .build()?;
//!
//!     let client = BulwarkClient::new(config)?;
//!
//!     let user = client
//!         .call("GetUser", json!({"id": 42}), CallOptions::default())
//!         .await?;
//!     println!("{user}");
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! Calls are dispatched dynamically by method name with
//! [`serde_json::Value`] payloads; typed per-service wrappers are thin
//! adapters over [`BulwarkClient::call`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod cache;
mod cache_key;
mod client;
mod codec;
mod config;
mod connection;
mod error;
mod events;
mod metrics;
mod transport;

pub mod mock;

// Public API exports
pub use cache::FallbackCache;
pub use cache_key::cache_key;
pub use client::{BulwarkClient, CallOptions, HealthReport};
pub use config::{ClientConfig, ClientConfigBuilder, TlsMode};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{ClientError, Result};
pub use events::ClientEvent;
pub use metrics::{MetricsSnapshot, MetricsTracker};
pub use transport::{ChannelState, GrpcTransport, GrpcTransportFactory, Transport, TransportFactory};
