//! MCP subsystem: registry (C4), proxy client/router (C6/C7), connection
//! pooling, and background health checking (C5).

pub mod client;
pub mod handlers;
pub mod health;
pub mod pool;
pub mod registry;
pub mod router;
pub mod types;

pub use client::{ClientError, McpClient};
pub use health::{HealthChecker, HealthState};
pub use pool::ConnectionPool;
pub use registry::{McpDescriptor, RegistryError};
pub use router::McpRouter;
