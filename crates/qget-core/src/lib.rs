//! qget Core - Download Engine and Scheduler
//!
//! This crate splits HTTP downloads into byte-range parts fetched in parallel,
//! runs them through named queues with their own concurrency, retry, bandwidth
//! and active-hours policy, and exposes everything through [`Manager`].

pub mod engine;
mod error;
mod manager;
mod queue;
mod scheduler;
mod storage;

pub use error::*;
pub use manager::*;
pub use queue::*;
pub use storage::*;

pub use qget_types as types;
