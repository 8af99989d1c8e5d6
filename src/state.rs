//! Shared application state.

use std::sync::Arc;

use crate::orchestrator::Orchestrator;

/// State handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}
