//! Server state

use crate::deploy::pipeline::PipelineRunner;

/// Server state shared across handlers
pub struct ServerState {
    pub runner: PipelineRunner,
}

impl ServerState {
    pub fn new(runner: PipelineRunner) -> Self {
        Self { runner }
    }
}
