//! Building blocks of the machine repository
//!
//! - [`entity`] - entity paths, collections and info records
//! - [`manifest`] - denormalized structural index with counters
//! - [`lock`] - advisory locks with expiry, retry and jitter
//! - [`allocator`] - dense `version1`, `version2`... key allocation
//! - [`seal`] - one-way seal transition and model validation
//! - [`store`] - commit-log and key-value entity stores
//! - [`dispatch`] - hand-off of instance jobs to the runtime

pub mod allocator;
pub mod config;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod seal;
pub mod store;
pub mod validation;
