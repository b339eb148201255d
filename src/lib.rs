//! AI Gateway Library
//!
//! Mediates chat requests between client applications and multiple LLM
//! provider protocols, with credential pooling, retry, streaming decode
//! and free-tier usage metering

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod providers;
pub mod services;
pub mod utils;

// Re-export common types
pub use config::Settings;
pub use handlers::{create_router, create_router_with_store, AppState};
pub use providers::{CredentialSet, ProviderAdapter, ProviderKind};
pub use services::{ClassifiedError, ErrorClass, KeyPool, KeyPoolRegistry, UsageLedger};
pub use utils::error::{AppError, AppResult};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Library description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get version information
pub fn version_info() -> String {
    format!("{} v{} - {}", NAME, VERSION, DESCRIPTION)
}
