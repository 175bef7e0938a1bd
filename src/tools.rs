//! Helpers local to this crate.

pub mod worker_pool;
