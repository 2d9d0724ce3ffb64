//! WebduhVercel deployer library
//!
//! Runs deployment pipelines (source, install, build, publish) and exposes
//! their status and lifecycle events.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
