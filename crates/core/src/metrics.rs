//! Background-run metrics
//!
//! One record per background execution, emitted through a sink so hosts can
//! forward it to their own telemetry. The default sink logs through
//! tracing.

use crate::result::{BackgroundRunResult, DexoptResultStatus};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Terminal status of one background run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackgroundRunStatus {
    JobFinished,
    AbortByCancellation,
    AbortByApi,
    AbortNoSpaceLeft,
    FatalError,
}

/// What one background run accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundRunMetrics {
    pub status: BackgroundRunStatus,
    pub duration_ms: i64,
    /// Packages whose final status was PERFORMED, across both passes.
    pub packages_dexopted: i32,
    /// Of those, packages whose compiled code embeds boot-classpath
    /// checksums (any optimized entry).
    pub packages_depending_on_boot_image: i32,
}

impl BackgroundRunMetrics {
    /// Derive the counters from a run result.
    pub fn from_result(
        status: BackgroundRunStatus,
        duration_ms: i64,
        result: &BackgroundRunResult,
    ) -> Self {
        let mut packages_dexopted = 0;
        let mut packages_depending_on_boot_image = 0;
        for pass in result.passes.values() {
            for pkg in &pass.package_results {
                if pkg.final_status() != DexoptResultStatus::Performed {
                    continue;
                }
                packages_dexopted += 1;
                let optimized = pkg.results.iter().any(|r| {
                    r.status == DexoptResultStatus::Performed && r.actual_mode.is_optimized()
                });
                if optimized {
                    packages_depending_on_boot_image += 1;
                }
            }
        }
        BackgroundRunMetrics {
            status,
            duration_ms,
            packages_dexopted,
            packages_depending_on_boot_image,
        }
    }
}

/// Destination for run metrics.
pub trait MetricsSink: Send + Sync {
    fn report_background_run(&self, metrics: &BackgroundRunMetrics);
}

/// Sink that logs through tracing.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn report_background_run(&self, metrics: &BackgroundRunMetrics) {
        info!(
            status = ?metrics.status,
            duration_ms = metrics.duration_ms,
            packages_dexopted = metrics.packages_dexopted,
            packages_depending_on_boot_image = metrics.packages_depending_on_boot_image,
            "Background dexopt run finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reason::CompilerMode;
    use crate::result::{BatchDexoptResult, BatchPass, ContainerDexoptResult, PackageDexoptResult};
    use std::path::PathBuf;

    fn performed(mode: CompilerMode) -> PackageDexoptResult {
        let mut entry = ContainerDexoptResult::skipped(
            PathBuf::from("/a/base.apk"),
            "arm64-v8a",
            mode,
        );
        entry.status = DexoptResultStatus::Performed;
        PackageDexoptResult {
            package_name: "a".to_string(),
            results: vec![entry],
            cancelled: false,
        }
    }

    #[test]
    fn test_counters() {
        let mut result = BackgroundRunResult::default();
        result.passes.insert(
            BatchPass::Main,
            BatchDexoptResult {
                reason: "bg-dexopt".to_string(),
                mode: CompilerMode::SpeedProfile,
                package_results: vec![
                    performed(CompilerMode::SpeedProfile),
                    performed(CompilerMode::Verify),
                    PackageDexoptResult::new("skipped"),
                ],
            },
        );
        let metrics =
            BackgroundRunMetrics::from_result(BackgroundRunStatus::JobFinished, 1000, &result);
        assert_eq!(metrics.packages_dexopted, 2);
        assert_eq!(metrics.packages_depending_on_boot_image, 1);
    }
}
