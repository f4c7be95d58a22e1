//! Command implementations
//!
//! One module per CLI subcommand group.

pub mod bg_job;
pub mod dump;
pub mod package;
pub mod packages;
pub mod profiles;

use dexopt_core::result::PackageDexoptResult;

/// Render one package result the same way everywhere.
pub fn print_package_result(result: &PackageDexoptResult) {
    println!(
        "{}: {:?}{}",
        result.package_name,
        result.final_status(),
        if result.cancelled { " (cancelled)" } else { "" }
    );
    for entry in &result.results {
        println!(
            "  {} ({}): {:?} mode={} wall={}ms cpu={}ms size={} was={}",
            entry.dex_path.display(),
            entry.abi,
            entry.status,
            entry.actual_mode,
            entry.wall_time_ms,
            entry.cpu_time_ms,
            bytesize::ByteSize(entry.size_bytes.max(0) as u64),
            bytesize::ByteSize(entry.size_before_bytes.max(0) as u64),
        );
        for error in &entry.external_profile_errors {
            println!("    bad external profile: {error}");
        }
    }
}
