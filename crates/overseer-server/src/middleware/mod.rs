//! Request middleware.

pub mod allowlist;

pub use allowlist::{allowlist_middleware, AllowList};
