#![forbid(unsafe_code)]
//! mossfs public API facade.
//!
//! Re-exports the engine from `moss-core` through a stable external
//! interface. This is the crate downstream consumers (tools, harnesses,
//! integrations) depend on.

pub use moss_core::*;
