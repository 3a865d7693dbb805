pub mod bridge;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod liveness;
pub mod metrics;
