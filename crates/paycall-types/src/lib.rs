//! Common types module for the paycall settlement system.
//!
//! This module defines the persisted records (quotes, payments, jobs and
//! idempotency entries), the HTTP request and response shapes, and the
//! configuration validation helpers shared by every paycall crate.

/// API types for HTTP endpoints and request/response structures.
pub mod api;
/// Idempotency cache records.
pub mod idempotency;
/// Job records for metered units of work.
pub mod job;
/// Payment claims and recorded payments.
pub mod payment;
/// Quotes: priced, single-use, time-bound authorizations.
pub mod quote;
/// Self-registration trait for pluggable implementations.
pub mod registry;
/// Storage namespaces.
pub mod storage;
/// Utility functions shared across crates.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

// Re-export all types for convenient access
pub use api::*;
pub use idempotency::*;
pub use job::*;
pub use payment::*;
pub use quote::*;
pub use registry::ImplementationRegistry;
pub use storage::*;
pub use utils::{current_timestamp, truncate_id};
pub use validation::*;
