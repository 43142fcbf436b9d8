pub mod beacon_client;
pub mod cache;
pub mod config;
pub mod cursor;
pub mod emitter;
pub mod env;
pub mod mev;
pub mod prometheus_metrics;
pub mod reconciler;
pub mod scheduler;
pub mod singleflight;
pub mod tracing;
