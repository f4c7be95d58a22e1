//! Core library for the dexopt service
//!
//! This crate contains the decision and orchestration engine for on-device
//! AOT compilation of dex containers: per-container planning, per-package
//! and batch driving, the background job, the dex-use registry, artifact
//! garbage collection, and the query surface. The compiler daemon and the
//! host platform are reached through trait seams in `daemon` and
//! `platform`.

pub mod background;
pub mod batch;
pub mod cancel;
pub mod cleanup;
pub mod clc;
pub mod daemon;
pub mod debounce;
pub mod dex_use;
pub mod dexopter;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod package;
pub mod paths;
pub mod planner;
pub mod platform;
pub mod profile;
pub mod reason;
pub mod result;
pub mod service;
pub mod target;
pub mod types;

// Re-export IndexMap for use by dependent crates (preserves insertion order for ordered maps)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
