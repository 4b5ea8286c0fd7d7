//! Connection and lifecycle core for an MCP server dashboard.
//!
//! The crate manages a registry of tool-provider servers and everything
//! that keeps them usable: configuration import from other tools'
//! dialects, subprocess supervision for stdio servers, protocol sessions
//! over stdio/SSE/HTTP transports, OAuth 2.1 bearer tokens, periodic
//! health probing with automatic reconnect, and a bounded debug
//! log/metrics recorder. The host application supplies a [`storage::Storage`]
//! backend and drives the whole thing through a [`hub::Hub`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcp_hub_core::hub::Hub;
//! use mcp_hub_core::storage::MemoryStorage;
//! use mcp_hub_core::types::{ServerConfig, TransportConfig};
//!
//! # async fn run() -> mcp_hub_core::Result<()> {
//! let hub = Hub::new(Arc::new(MemoryStorage::new()));
//! let server = hub
//!     .add_server(ServerConfig::new(
//!         "filesystem",
//!         TransportConfig::Stdio {
//!             command: "npx".into(),
//!             args: vec!["@modelcontextprotocol/server-filesystem".into()],
//!             env: Default::default(),
//!             cwd: None,
//!         },
//!     ))
//!     .await?;
//! let state = hub.connect(&server.id).await?;
//! println!("{} tools available", state.tools.len());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod hub;
pub mod process;
pub mod protocol;
pub mod recorder;
pub mod storage;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use hub::Hub;
