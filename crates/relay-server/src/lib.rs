pub mod config;
pub mod connection;
pub mod conversations;
pub mod groups;
pub mod presence;
pub mod routing;
pub mod server;

pub use config::{RoutingConfig, ServerConfig};
pub use connection::{ConnectionRegistry, Identity};
pub use routing::{Inbound, OperatorVerifier, RoutingEngine, RoutingStats, TrustedVerifier};
pub use server::{start, ServerHandle};
