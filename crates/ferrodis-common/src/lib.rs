//! Ferrodis Common - Shared types and configuration
//!
//! This crate provides the data type tags, background task descriptions and
//! storage options shared by the storage engine and its tooling.

pub mod config;
pub mod types;

pub use config::StorageOptions;
pub use types::*;
