//! Failscout library crate
//!
//! Exposes the discovery engine so benchmarks and external tooling can drive
//! it without going through CLI startup.

pub mod analyzer;
pub mod cache;
pub mod classify;
pub mod client;
pub mod config;
pub mod discover;
pub mod error;
pub mod events;
pub mod models;
pub mod selection;
pub mod util;
