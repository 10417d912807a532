// ============================================================================
// cmdgate Library
// ============================================================================

pub mod core;
pub mod connection;
pub mod gateway;

// Re-export main types for convenience
pub use crate::core::{GatewayError, Result};
pub use gateway::{AmbientConnection, CommandGateway, CommandOf, CommandRunner, GatewayStats};

// Re-export the driver boundary
pub use connection::{
    BoundCommand,
    Command,
    Connection,
    ConnectionFactory,
    ConnectionId,
    config::{ConnectionConfig, GatewayMode, GatewayOptions, IsolationLevel},
};

pub use tokio_util::sync::CancellationToken;
