pub mod bus;
pub mod config;
mod db;
pub mod migration;
pub mod store;

pub use preagg_core::*;

pub use bus::BroadcastBus;
pub use config::{DatabaseConfig, PoolConfig, PreaggConfig};
pub use store::PreaggStore;
