//! Data models module
//!
//! Defines the provider-agnostic chat model and the per-protocol wire
//! structures the adapters translate it into

pub mod chat;
pub mod gemini;
pub mod openai;
