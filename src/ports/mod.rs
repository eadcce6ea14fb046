//! Port traits (interfaces) for the hexagonal architecture.

pub mod config_port;
pub mod feed_port;
pub mod store_port;
