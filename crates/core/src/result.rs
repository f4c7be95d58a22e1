//! Structured results for dexopt operations
//!
//! Results are values, not errors: a failed or skipped container shows up as
//! an entry with the corresponding status, and callers inspect the aggregate.

use crate::reason::CompilerMode;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of one (container, ABI) planning step.
///
/// The derived order ranks outcomes from best to worst; package aggregation
/// takes the maximum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DexoptResultStatus {
    #[default]
    Skipped,
    Performed,
    Failed,
    Cancelled,
}

/// Extra detail bits attached to a per-container result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtendedStatusFlags(pub u32);

impl ExtendedStatusFlags {
    /// The container carries no executable bytecode.
    pub const NO_DEX_CODE: ExtendedStatusFlags = ExtendedStatusFlags(1 << 0);
    /// Skipped because the storage volume had no allocatable space.
    pub const STORAGE_LOW: ExtendedStatusFlags = ExtendedStatusFlags(1 << 1);
    /// An external profile existed but could not be used.
    pub const BAD_EXTERNAL_PROFILE: ExtendedStatusFlags = ExtendedStatusFlags(1 << 2);

    pub fn contains(&self, other: ExtendedStatusFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ExtendedStatusFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ExtendedStatusFlags {
    type Output = ExtendedStatusFlags;
    fn bitor(self, rhs: ExtendedStatusFlags) -> ExtendedStatusFlags {
        ExtendedStatusFlags(self.0 | rhs.0)
    }
}

/// Result of planning one container for one ABI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDexoptResult {
    pub dex_path: PathBuf,
    pub abi: String,
    pub status: DexoptResultStatus,
    /// Compiler mode actually used; may be lower than the requested one
    /// after planner adjustments.
    pub actual_mode: CompilerMode,
    pub wall_time_ms: i64,
    pub cpu_time_ms: i64,
    pub size_bytes: i64,
    pub size_before_bytes: i64,
    pub extended_flags: ExtendedStatusFlags,
    /// Messages describing external profiles that were rejected.
    pub external_profile_errors: Vec<String>,
}

impl ContainerDexoptResult {
    pub fn skipped(dex_path: PathBuf, abi: &str, actual_mode: CompilerMode) -> Self {
        ContainerDexoptResult {
            dex_path,
            abi: abi.to_string(),
            status: DexoptResultStatus::Skipped,
            actual_mode,
            wall_time_ms: 0,
            cpu_time_ms: 0,
            size_bytes: 0,
            size_before_bytes: 0,
            extended_flags: ExtendedStatusFlags::default(),
            external_profile_errors: Vec::new(),
        }
    }

    pub fn cancelled(dex_path: PathBuf, abi: &str, actual_mode: CompilerMode) -> Self {
        ContainerDexoptResult {
            status: DexoptResultStatus::Cancelled,
            ..Self::skipped(dex_path, abi, actual_mode)
        }
    }

    pub fn failed(dex_path: PathBuf, abi: &str, actual_mode: CompilerMode) -> Self {
        ContainerDexoptResult {
            status: DexoptResultStatus::Failed,
            ..Self::skipped(dex_path, abi, actual_mode)
        }
    }
}

/// Aggregated result for one package.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PackageDexoptResult {
    pub package_name: String,
    /// Per-container entries in container-iteration order, per-ABI within.
    pub results: Vec<ContainerDexoptResult>,
    /// Set once cancellation was observed while working on this package.
    pub cancelled: bool,
}

impl PackageDexoptResult {
    pub fn new(package_name: impl Into<String>) -> Self {
        PackageDexoptResult {
            package_name: package_name.into(),
            results: Vec::new(),
            cancelled: false,
        }
    }

    /// Worst non-skipped outcome; a package with no entries (or only skipped
    /// ones) counts as skipped.
    pub fn final_status(&self) -> DexoptResultStatus {
        self.results
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(DexoptResultStatus::Skipped)
    }

    pub fn has_updated_artifacts(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.status == DexoptResultStatus::Performed)
    }
}

/// Result of one batch pass over a package list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchDexoptResult {
    pub reason: String,
    pub mode: CompilerMode,
    /// Package results in expansion order.
    pub package_results: Vec<PackageDexoptResult>,
}

impl BatchDexoptResult {
    /// The view handed to done-callbacks registered with `only_on_updates`:
    /// packages that actually produced new artifacts.
    pub fn with_updates_only(&self) -> BatchDexoptResult {
        BatchDexoptResult {
            reason: self.reason.clone(),
            mode: self.mode,
            package_results: self
                .package_results
                .iter()
                .filter(|r| r.final_status() == DexoptResultStatus::Performed)
                .cloned()
                .collect(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.package_results.iter().any(|r| r.cancelled)
    }
}

/// Passes of a background run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchPass {
    Downgrade,
    Main,
}

/// Everything a background run produced, addressable by pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BackgroundRunResult {
    pub passes: IndexMap<BatchPass, BatchDexoptResult>,
}

impl BackgroundRunResult {
    pub fn pass(&self, pass: BatchPass) -> Option<&BatchDexoptResult> {
        self.passes.get(&pass)
    }

    pub fn main(&self) -> Option<&BatchDexoptResult> {
        self.pass(BatchPass::Main)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: DexoptResultStatus) -> ContainerDexoptResult {
        ContainerDexoptResult {
            status,
            ..ContainerDexoptResult::skipped(PathBuf::from("/a/base.apk"), "arm64-v8a", CompilerMode::Verify)
        }
    }

    #[test]
    fn test_final_status_worst_non_skipped() {
        let mut result = PackageDexoptResult::new("com.example");
        assert_eq!(result.final_status(), DexoptResultStatus::Skipped);

        result.results.push(entry(DexoptResultStatus::Performed));
        assert_eq!(result.final_status(), DexoptResultStatus::Performed);

        result.results.push(entry(DexoptResultStatus::Failed));
        assert_eq!(result.final_status(), DexoptResultStatus::Failed);

        result.results.push(entry(DexoptResultStatus::Cancelled));
        assert_eq!(result.final_status(), DexoptResultStatus::Cancelled);
    }

    #[test]
    fn test_skipped_does_not_mask_performed() {
        let mut result = PackageDexoptResult::new("com.example");
        result.results.push(entry(DexoptResultStatus::Skipped));
        result.results.push(entry(DexoptResultStatus::Performed));
        assert_eq!(result.final_status(), DexoptResultStatus::Performed);
        assert!(result.has_updated_artifacts());
    }

    #[test]
    fn test_updates_only_view() {
        let mut batch = BatchDexoptResult {
            reason: "bg-dexopt".to_string(),
            mode: CompilerMode::SpeedProfile,
            package_results: Vec::new(),
        };
        let mut performed = PackageDexoptResult::new("a");
        performed.results.push(entry(DexoptResultStatus::Performed));
        let mut skipped = PackageDexoptResult::new("b");
        skipped.results.push(entry(DexoptResultStatus::Skipped));
        batch.package_results.push(performed);
        batch.package_results.push(skipped);

        let filtered = batch.with_updates_only();
        assert_eq!(filtered.package_results.len(), 1);
        assert_eq!(filtered.package_results[0].package_name, "a");
    }
}
