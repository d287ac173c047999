//! # conn-supervisor - Connection Supervisor for a desktop SSH/SFTP client
//!
//! `conn-supervisor` owns every live SSH connection on behalf of a desktop
//! client's presentation layer: transport setup and keepalive, shell
//! multiplexing, the SFTP filesystem and transfer queue, local/remote/dynamic
//! port forwarding, host-key verification (TOFU), and reconnection with
//! exponential backoff. It publishes every state change as an [`events::Event`]
//! on a shared [`events::EventBus`] and accepts commands either directly
//! through [`supervisor::ConnectionSupervisor`]'s methods or through the
//! tagged [`dispatcher::Request`] surface.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conn_supervisor::events::EventBus;
//! use conn_supervisor::ids::ConnectionId;
//! use conn_supervisor::reconnect::ReconnectConfig;
//! use conn_supervisor::stores::MemoryHostKeyStore;
//! use conn_supervisor::supervisor::ConnectionSupervisor;
//! use conn_supervisor::transport::ConnectConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let supervisor = ConnectionSupervisor::new(
//!         EventBus::new(),
//!         Arc::new(MemoryHostKeyStore::new()),
//!         4,
//!         0,
//!         ReconnectConfig::default(),
//!     );
//!
//!     let connection_id = ConnectionId::generate();
//!     let config = ConnectConfig {
//!         host: "192.168.1.1".to_string(),
//!         port: 22,
//!         username: "admin".to_string(),
//!         ..Default::default()
//!     };
//!
//!     supervisor.connect(connection_id.clone(), config, None).await?;
//!     supervisor.disconnect(&connection_id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`supervisor::ConnectionSupervisor`] - owns every connection's lifecycle
//! - [`dispatcher`] - the tagged request/reply surface wrapping the supervisor
//! - [`transport`] - dialing, authentication, keepalive, host-key handshake
//! - [`shell`] - PTY shell multiplexing over a connection
//! - [`sftp`] - filesystem operations and the transfer queue
//! - [`portforward`] - local, remote, and dynamic (SOCKS5) port forwarding
//! - [`reconnect`] - the backoff-driven reconnect state machine
//! - [`hostkey`] - trust-on-first-use host-key verification
//! - [`stores`] - pluggable host-key/credential/session-config persistence
//! - [`events`] - the publish/subscribe event bus
//! - [`error`] - the crate-wide error type
//! - [`config`] - SSH algorithm tables and security-level presets

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod hostkey;
pub mod ids;
pub mod portforward;
pub mod reconnect;
pub mod sftp;
pub mod shell;
pub mod stores;
pub mod supervisor;
pub mod transport;
