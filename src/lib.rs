//! Safe reload engine for a semantic-search index.
//!
//! Validates a corpus, embeds it into a staging table, backs up and promotes
//! it into the live table, then health-checks the result.

pub mod config;
pub mod connection;
pub mod corpus;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod health;
pub mod loader;
pub mod maintenance;
pub mod models;
pub mod promote;
pub mod retry;
pub mod store;

pub use engine::{LoadOptions, ReloadEngine, RunReport};
pub use error::{Error, Result};
