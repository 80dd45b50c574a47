//! tierio Common - Shared types and utilities
//!
//! This crate provides the identifiers, write options, error definitions and
//! configuration types used by every tierio component.

pub mod config;
pub mod error;
pub mod types;

pub use config::WorkerConfig;
pub use error::{Error, Result};
pub use types::*;
