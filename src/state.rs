//! Shared, read-only context handed to every request.

use crate::{
    config::ServiceConfig,
    services::{grid_store::GridStore, retrieval_service::RetrievalService},
};
use std::sync::Arc;

/// Built once at startup; cloning only bumps reference counts.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub retrieval: RetrievalService,
}

impl AppState {
    pub fn new(config: ServiceConfig, store: Arc<dyn GridStore>) -> Self {
        let retrieval = RetrievalService::new(store, config.resolution, config.read_chunk_size);
        Self {
            config: Arc::new(config),
            retrieval,
        }
    }
}
