//! overseer-core - Core library for Overseer watcher nodes
//!
//! This crate provides everything a watcher node needs below the HTTP surface:
//!
//! - **types**: Watch sessions, observations, verdicts and wire types
//! - **extractor**: Per game kind line classifiers and their registry
//! - **consensus**: Noise-tolerant voting over observations
//! - **capture**: Supervision of the external capture process
//! - **db**: SQLite watch session registry
//! - **client**: HTTP clients for peer nodes and the external application

pub mod capture;
pub mod client;
pub mod consensus;
pub mod db;
pub mod error;
pub mod extractor;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
