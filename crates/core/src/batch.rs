//! Batch dexopt driver
//!
//! Expands a package list over shared-library edges, fans the result out
//! over a bounded worker pool (one child cancellation signal per package),
//! reports progress, and invokes registered done-callbacks at the end.

use crate::cancel::CancellationSignal;
use crate::dex_use::DexUseRegistry;
use crate::dexopter::{can_dexopt_package, dexopt_package};
use crate::errors::{DexoptError, Result};
use crate::package::Snapshot;
use crate::platform::Platform;
use crate::reason::{self, REASON_BOOT_AFTER_MAINLINE_UPDATE, REASON_INACTIVE};
use crate::result::{BatchDexoptResult, PackageDexoptResult};
use crate::types::{DexoptFlags, DexoptParams};
use indexmap::IndexSet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Last-resort fuse on the batch wakelock; the guard drop is the normal
/// release path.
const WAKELOCK_FUSE: Duration = Duration::from_secs(10 * 60 * 60);

/// Invoked with `(current, total)` as packages complete, starting with
/// `(0, total)`.
pub type ProgressCallback = Arc<dyn Fn(i32, i32) + Send + Sync>;

/// Callback invoked after a batch completes.
#[derive(Clone)]
pub struct DoneCallback {
    /// Receive only packages that produced new artifacts; skipped entirely
    /// when none did.
    pub only_on_updates: bool,
    pub callback: Arc<dyn Fn(&BatchDexoptResult) + Send + Sync>,
}

/// Replacement list and/or params returned by a batch-start callback. The
/// reason itself cannot be changed.
pub struct BatchOverride {
    pub packages: Option<Vec<String>>,
    pub params: Option<DexoptParams>,
}

/// Hook invoked with `(reason, default packages, default params)` before a
/// scheduled batch starts.
pub type BatchStartCallback =
    Box<dyn Fn(&str, &[String], &DexoptParams) -> Option<BatchOverride> + Send + Sync>;

/// Callback registrations shared between the service surface and the
/// background job.
#[derive(Default)]
pub struct BatchCallbacks {
    pub batch_start: Mutex<Option<BatchStartCallback>>,
    pub done: Mutex<Vec<DoneCallback>>,
}

impl BatchCallbacks {
    pub fn done_callbacks(&self) -> Vec<DoneCallback> {
        self.done.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Milliseconds of inactivity after which a package counts as inactive, per
/// `pm.dexopt.downgrade_after_inactive_days`. `None` means never.
pub fn downgrade_after_inactive_ms(props: &dyn crate::platform::SystemProperties) -> Option<i64> {
    props
        .get_int("pm.dexopt.downgrade_after_inactive_days")
        .filter(|days| *days > 0)
        .map(|days| days * 24 * 60 * 60 * 1000)
}

/// Last activity of a package: the later of the package manager's view and
/// the dex-use registry's.
pub fn package_last_active_ms(
    registry: &DexUseRegistry,
    pkg: &crate::package::PackageState,
) -> i64 {
    pkg.last_used_ms()
        .max(registry.package_last_used_ms(&pkg.name))
}

/// The default package list for a batch reason.
pub fn default_package_list(
    platform: &Platform,
    registry: &DexUseRegistry,
    snapshot: &Snapshot,
    batch_reason: &str,
) -> Vec<String> {
    let eligible = |pkg: &crate::package::PackageState| can_dexopt_package(platform, pkg);

    if batch_reason == REASON_BOOT_AFTER_MAINLINE_UPDATE {
        // Only the packages whose code the updated modules feed directly.
        let config = &platform.config;
        let mut names = vec![config.system_ui_package.clone()];
        names.extend(config.launcher_package.clone());
        return names
            .into_iter()
            .filter(|name| snapshot.package(name).map(|pkg| eligible(pkg)).unwrap_or(false))
            .collect();
    }

    let threshold = downgrade_after_inactive_ms(&*platform.props);
    let now_ms = platform.clock.now_ms();
    let is_inactive = |pkg: &crate::package::PackageState| match threshold {
        Some(window) => package_last_active_ms(registry, pkg) <= now_ms - window,
        None => false,
    };

    let mut selected: Vec<(&String, i64)> = snapshot
        .packages
        .iter()
        .filter(|(_, pkg)| eligible(pkg))
        .filter(|(_, pkg)| {
            if batch_reason == REASON_INACTIVE {
                is_inactive(pkg)
            } else {
                !is_inactive(pkg)
            }
        })
        .map(|(name, pkg)| (name, package_last_active_ms(registry, pkg)))
        .collect();

    if batch_reason == REASON_INACTIVE {
        // Most stale first, so the downgrade recovers the most space early.
        selected.sort_by_key(|(_, last_active)| *last_active);
    } else {
        selected.sort_by_key(|(_, last_active)| std::cmp::Reverse(*last_active));
    }
    selected.into_iter().map(|(name, _)| name.clone()).collect()
}

/// Expand the supplied packages over `uses-library` edges: breadth-first in
/// insertion order, each library name visited once, only APK-packaged
/// non-native libraries added, each addition re-checked for eligibility.
pub fn expand_packages(
    platform: &Platform,
    snapshot: &Snapshot,
    supplied: &[String],
    include_dependencies: bool,
) -> Result<Vec<String>> {
    let mut ordered: IndexSet<String> = IndexSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for name in supplied {
        let pkg = snapshot.expect_package(name)?;
        if ordered.insert(name.clone()) && include_dependencies {
            queue.extend(pkg.uses_libraries.iter().cloned());
        }
    }
    if include_dependencies {
        let mut visited: IndexSet<String> = IndexSet::new();
        while let Some(library_name) = queue.pop_front() {
            if !visited.insert(library_name.clone()) {
                continue;
            }
            let Some(library) = snapshot.library(&library_name) else {
                debug!(library = %library_name, "Unknown shared library, skipping");
                continue;
            };
            queue.extend(library.dependencies.iter().cloned());
            if !library.is_apk || library.is_native {
                continue;
            }
            let Some(provider) = &library.package_name else {
                continue;
            };
            let Some(pkg) = snapshot.package(provider) else {
                continue;
            };
            if can_dexopt_package(platform, pkg) {
                ordered.insert(provider.clone());
            }
        }
    }
    Ok(ordered.into_iter().collect())
}

/// Run one batch pass over `package_names`.
#[instrument(skip_all, fields(reason = %params.reason, packages = package_names.len()))]
pub async fn dexopt_packages(
    platform: &Platform,
    registry: &Arc<DexUseRegistry>,
    snapshot: &Arc<Snapshot>,
    package_names: Vec<String>,
    params: &DexoptParams,
    cancel: &CancellationSignal,
    progress: Option<ProgressCallback>,
    done_callbacks: &[DoneCallback],
) -> Result<BatchDexoptResult> {
    params.validate()?;
    let expanded = expand_packages(
        platform,
        snapshot,
        &package_names,
        params.flags.contains(DexoptFlags::SHOULD_INCLUDE_DEPENDENCIES),
    )?;

    let _wakelock = platform
        .power
        .acquire_wakelock("dexopt-batch", WAKELOCK_FUSE);

    let width = reason::concurrency(&params.reason, &*platform.props);
    let total = expanded.len() as i32;
    info!(total, width, "Starting batch dexopt");

    // Initial notification before any completion event.
    let progress_state = Arc::new(Mutex::new(0i32));
    if let Some(progress) = &progress {
        progress(0, total);
    }

    let semaphore = Arc::new(Semaphore::new(width.max(1)));
    let mut handles = Vec::with_capacity(expanded.len());
    for name in &expanded {
        let platform = platform.clone();
        let registry = registry.clone();
        let snapshot = snapshot.clone();
        let params = params.clone();
        let name = name.clone();
        let child_cancel = cancel.child();
        let semaphore = semaphore.clone();
        let progress = progress.clone();
        let progress_state = progress_state.clone();

        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| DexoptError::internal(format!("worker pool closed: {e}")))?;
            let outcome = dexopt_package(
                &platform,
                &registry,
                &snapshot,
                &name,
                &params,
                &child_cancel,
            )
            .await;
            // Progress is emitted under the lock so observers see
            // monotonically increasing counts.
            {
                let mut current = progress_state.lock().unwrap_or_else(|e| e.into_inner());
                *current += 1;
                if let Some(progress) = &progress {
                    progress(*current, total);
                }
            }
            outcome
        });
        handles.push(handle);
    }

    let mut package_results: Vec<PackageDexoptResult> = Vec::with_capacity(handles.len());
    for handle in handles {
        let outcome = handle
            .await
            .map_err(|e| DexoptError::internal(format!("batch worker panicked: {e}")))??;
        package_results.push(outcome);
    }

    let result = BatchDexoptResult {
        reason: params.reason.clone(),
        mode: params.mode,
        package_results,
    };

    for done in done_callbacks {
        let view = if done.only_on_updates {
            let filtered = result.with_updates_only();
            if filtered.package_results.is_empty() {
                continue;
            }
            filtered
        } else {
            result.clone()
        };
        let callback = done.callback.clone();
        if let Err(panic) =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&view)))
        {
            warn!(?panic, "Dexopt done-callback panicked");
        }
    }

    Ok(result)
}
