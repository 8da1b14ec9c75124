pub mod action;
pub mod audio;
pub mod backends;
pub mod config_loader;
pub mod ear;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod intent;
pub mod orchestrator;
pub mod rate_limiter;
pub mod resolver;
pub mod service;
pub mod system;
pub mod wake;
pub mod worker;
pub mod wyoming;
