//! StrataMap common types, errors, and numeric utilities.
//!
//! This crate provides shared definitions used across all StrataMap components.

pub mod error;
pub mod num;
pub mod poisson;

pub use error::{Result, StrataError};
