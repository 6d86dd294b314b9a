pub mod ai;
pub mod api;
pub mod app;
pub mod buffer;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod error;
pub mod flow;
pub mod gateway;
pub mod handoff;
pub mod logging;
pub mod memory_store;
pub mod pg_store;
pub mod prompting;
pub mod ratelimit;
pub mod realtime;
pub mod resolver;
pub mod routing;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;
