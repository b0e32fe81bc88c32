#![deny(unsafe_code)]

//! In-memory MQTT v3.1 / v3.1.1 broker.
//!
//! ```rust,no_run
//! use mqbroker::context::ServerContext;
//! use mqbroker::net::Builder;
//! use mqbroker::server::MqttServer;
//!
//! #[tokio::main]
//! async fn main() -> mqbroker::Result<()> {
//!     let scx = ServerContext::new().mqtt_max_sessions(0).build();
//!
//!     MqttServer::new(scx)
//!         .listener(Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 1883).into()).bind()?)
//!         .build()
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```

pub mod context;
pub mod inflight;
pub mod logger;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod retain;
pub mod server;
pub mod session;
pub mod stats;
pub mod topic;
pub mod types;
pub mod v3;

pub use mqbroker_codec as codec;
pub use mqbroker_net as net;

pub use context::ServerContext;
pub use server::MqttServer;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
