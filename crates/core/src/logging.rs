//! Logging setup
//!
//! One subscriber for the whole service. The interesting context lives in
//! spans (`pkg`, `dex`, `reason` fields on the planner, dexopter, and batch
//! driver), so the human format drops targets and leans on span scopes.
//! `RUST_LOG` overrides the default filter; `DEXOPT_LOG_FORMAT=json` turns
//! on line-delimited JSON for log collectors.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the global subscriber. Call once, from the binary.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("DEXOPT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().flatten_event(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }
    Ok(())
}
