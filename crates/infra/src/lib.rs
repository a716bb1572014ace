//! Infrastructure layer: job persistence, task queue, execution engine, config.

pub mod config;
pub mod engine;
pub mod job_store;
pub mod queue;


pub use config::EngineConfig;
pub use engine::Engine;
