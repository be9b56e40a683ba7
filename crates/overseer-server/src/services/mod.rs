//! Service layer for the watcher node
//!
//! Contains the logic behind the HTTP surface: delegation, the per-stream
//! watch tasks, result reporting and startup recovery.

pub mod delegation;
pub mod pool;
pub mod recovery;
pub mod reporter;
pub mod watcher;

pub use pool::WatchPool;
pub use reporter::{HttpSink, LogSink, ResultSink};
