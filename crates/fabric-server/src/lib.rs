//! HTTP surface of the fabric.
//!
//! Tenants run modules and workflows over HTTP; peers submit raw jobs to
//! `/exec`. This crate handles:
//!
//! - Routing and request conversion
//! - Bearer authorization against the control plane
//! - Mapping execution results to HTTP status, headers and body
//! - Server lifecycle and graceful shutdown
//!
//! # Quick Start
//!
//! ```ignore
//! use fabric_common::ConfigFile;
//! use fabric_server::FabricServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let file = ConfigFile::from_file("fabric.toml")?;
//!     FabricServer::from_config(&file)?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use response::FabricResponse;
pub use router::build_router;
pub use server::{FabricServer, ServerConfig, TestHandle};
pub use state::AppState;
