//! Core library for love-me, a personal automation daemon: configuration,
//! storage, the tool router, the LLM turn coordinator, the workflow engine,
//! and the email pipeline.

pub mod config;
pub mod cron;
pub mod email;
pub mod error;
pub mod events;
pub mod llm;
pub mod model;
pub mod storage;
pub mod tools;
pub mod workflow;

pub use error::*;

/// Returns the version of the love-me-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
