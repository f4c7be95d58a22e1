//! Per-package dexopt
//!
//! Builds the container target list for a package (primary set first, then
//! secondary if requested), drives the planner over each, and aggregates
//! the entries. A failure in one container never stops the next; a
//! cancellation does.

use crate::cancel::CancellationSignal;
use crate::clc;
use crate::dex_use::DexUseRegistry;
use crate::errors::{DexoptError, Result};
use crate::package::{PackageState, Snapshot};
use crate::planner::ContainerPlanner;
use crate::platform::Platform;
use crate::result::{DexoptResultStatus, PackageDexoptResult};
use crate::target::{DexoptTarget, PrimaryTarget, SecondaryTarget};
use crate::types::DexoptFlags;
use std::sync::Arc;
use tracing::{debug, instrument};

/// The dexopt-eligibility predicate used everywhere a package list is
/// assembled: the package must carry code and must not be hibernating
/// (when a hibernation manager exists).
pub fn can_dexopt_package(platform: &Platform, pkg: &PackageState) -> bool {
    pkg.has_code() && !platform.is_hibernating(&pkg.name)
}

/// Dexopt all requested containers of one package.
#[instrument(skip_all, fields(pkg = %package_name, reason = %params.reason))]
pub async fn dexopt_package(
    platform: &Platform,
    registry: &Arc<DexUseRegistry>,
    snapshot: &Snapshot,
    package_name: &str,
    params: &crate::types::DexoptParams,
    cancel: &CancellationSignal,
) -> Result<PackageDexoptResult> {
    params.validate()?;
    let pkg = snapshot.expect_package(package_name)?;
    let mut result = PackageDexoptResult::new(package_name);

    if !can_dexopt_package(platform, pkg) {
        debug!("Package is not dexoptable");
        return Ok(result);
    }

    let single_split = if params.flags.contains(DexoptFlags::FOR_SINGLE_SPLIT) {
        let name = params.split_name.as_deref();
        if pkg.split(name).is_none() {
            return Err(DexoptError::invalid_argument(format!(
                "unknown split {name:?} in package \"{package_name}\""
            )));
        }
        Some(name.map(str::to_string))
    } else {
        None
    };

    let mut targets: Vec<Box<dyn DexoptTarget>> = Vec::new();

    if params.flags.contains(DexoptFlags::FOR_PRIMARY_DEX) {
        let code_splits = pkg.code_splits();
        let contexts = clc::derive_primary_contexts(pkg);
        let user_ids = platform.users.user_ids();
        let is_library_provider = snapshot.is_library_provider(package_name);
        for (split, context) in code_splits.iter().zip(contexts) {
            if let Some(wanted) = &single_split {
                if split.split_name != *wanted {
                    continue;
                }
            }
            let needs_shared = is_library_provider
                || registry.is_primary_dex_used_by_other_apps(package_name, &split.path);
            targets.push(Box::new(PrimaryTarget::new(
                &platform.config,
                pkg,
                split,
                context,
                &user_ids,
                needs_shared,
            )));
        }
    }

    if params.flags.contains(DexoptFlags::FOR_SECONDARY_DEX) {
        for info in registry
            .filtered_detailed_secondary_dex_info(package_name)
            .await?
        {
            targets.push(Box::new(SecondaryTarget::new(pkg, info)));
        }
    }

    let planner = ContainerPlanner::new(platform, pkg, params, cancel);
    for target in &targets {
        if cancel.is_cancelled() {
            result.cancelled = true;
            break;
        }
        if !target.is_dexoptable() {
            debug!(dex = ?target.dex_path(), "Container is not dexoptable");
            continue;
        }
        let entries = planner.run(target.as_ref()).await?;
        let saw_cancel = entries
            .iter()
            .any(|e| e.status == DexoptResultStatus::Cancelled);
        result.results.extend(entries);
        if saw_cancel {
            result.cancelled = true;
            break;
        }
    }
    if cancel.is_cancelled() {
        result.cancelled = true;
    }
    Ok(result)
}
