//! Utilities module
//!
//! Contains error handling and shared helpers

pub mod error;
pub mod week;
