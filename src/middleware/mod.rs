//! Middleware module
//!
//! Request authentication and logging

pub mod auth;
pub mod logging;
