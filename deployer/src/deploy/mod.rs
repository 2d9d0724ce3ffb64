//! Deployment module

pub mod edge;
pub mod events;
pub mod fsm;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod recorder;
pub mod source;
pub mod store;
