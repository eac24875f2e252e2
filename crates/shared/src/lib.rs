// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clubhouse Shared
//!
//! Database plumbing used by both the billing library and the worker.

pub mod db;

pub use db::{create_pool, create_read_pool, run_migrations, DatabaseError, PoolSettings};
