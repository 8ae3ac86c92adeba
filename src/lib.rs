//! # Storage Plugins Library
//!
//! Storage-backend adapters for a media host: credential negotiation against
//! an auth broker, rate-limited vendor access and directory browsing.

pub mod adapters;
pub mod auth;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod error;
pub mod http_client;
pub mod ratelimit;
pub mod retry;
pub mod telemetry;

pub use error::{HostAction, PluginError, Result};
