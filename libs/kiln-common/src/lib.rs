pub mod challenge;
pub mod config;
pub mod queue;
pub mod redis;
pub mod runtime;
pub mod store;
pub mod types;
