//! Payment lifecycle and gateway reconciliation.
//!
//! Payment attempts are created against pluggable provider adapters,
//! settled by client-driven verification, provider callbacks or manual
//! reconciliation, and compensated when they fail.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
pub mod logging;
