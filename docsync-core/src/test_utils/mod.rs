//! Test utilities shared by unit and integration tests
//!
//! Provides a counter document model, operation builders and async wait
//! helpers.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
