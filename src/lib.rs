pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod pricing;
pub mod quota;
pub mod routes;
pub mod scrape;
pub mod search;
pub mod single_flight;
pub mod stdio_service;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

pub use config::GatewayConfig;
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use gateway::Gateway;
pub use types::*;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Builds the production gateway and starts its periodic maintenance.
    pub fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let gateway = Gateway::from_config(config)?;
        gateway.spawn_maintenance();
        Ok(Self::new(gateway))
    }
}
