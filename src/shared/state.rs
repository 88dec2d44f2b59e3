use crate::config::AppConfig;
use crate::tickets::store::ConfigStore;
use crate::tickets::TicketEngine;
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub engine: Arc<TicketEngine>,
    pub configs: Arc<ConfigStore>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            engine: Arc::clone(&self.engine),
            configs: Arc::clone(&self.configs),
        }
    }
}
