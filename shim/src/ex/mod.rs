//! Executive (ex)
//!
//! - **Worker Threads**: the per-mount request pool

pub mod worker;

pub use worker::{spawn_workers, worker_loop, WorkerStats};
