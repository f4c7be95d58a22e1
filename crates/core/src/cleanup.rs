//! Artifact and profile garbage collection
//!
//! Mark and sweep: walk the installed packages, collect everything that is
//! still wanted (profiles of every code-bearing package, artifacts the
//! daemon reports as valid), then hand the keep lists to the daemon's
//! cleanup primitive, which deletes the rest and reports freed bytes.
//! Dex-use records of dead packages and vanished files are pruned first.

use crate::clc;
use crate::daemon::{ArtifactsPath, RuntimeArtifactsPath, VdexPath};
use crate::dex_use::DexUseRegistry;
use crate::errors::Result;
use crate::package::Snapshot;
use crate::paths;
use crate::platform::Platform;
use crate::reason::CompilerMode;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Default)]
struct KeepLists {
    profiles: Vec<PathBuf>,
    artifacts: Vec<ArtifactsPath>,
    vdex: Vec<VdexPath>,
    runtime: Vec<RuntimeArtifactsPath>,
}

impl KeepLists {
    /// Classify the daemon-reported compiler filter for one artifact set.
    /// `vdex-only` keeps just the vdex; a real verification-level mode also
    /// keeps the runtime-image slot; anything unparsable (for example
    /// `run-from-apk`) keeps nothing.
    fn mark(
        &mut self,
        compiler_filter: &str,
        artifacts: ArtifactsPath,
        runtime: Option<RuntimeArtifactsPath>,
    ) {
        if compiler_filter == "vdex-only" {
            self.vdex.push(VdexPath(artifacts));
            return;
        }
        match CompilerMode::from_name(compiler_filter) {
            Ok(CompilerMode::Skip) | Ok(CompilerMode::Noop) | Err(_) => {}
            Ok(mode) => {
                if mode.is_non_optimized() {
                    if let Some(runtime) = runtime {
                        self.runtime.push(runtime);
                    }
                }
                self.artifacts.push(artifacts);
            }
        }
    }
}

/// Run one garbage-collection cycle. Returns bytes freed by the daemon.
#[instrument(skip_all)]
pub async fn cleanup(
    platform: &Platform,
    registry: &Arc<DexUseRegistry>,
    snapshot: &Snapshot,
) -> Result<i64> {
    let live: HashSet<String> = snapshot.packages.keys().cloned().collect();
    registry.cleanup(&live).await?;

    let daemon = &platform.daemon;
    let user_ids = platform.users.user_ids();
    let mut keep = KeepLists::default();

    for pkg in snapshot.packages.values() {
        if !pkg.has_code() {
            continue;
        }

        // Profiles survive hibernation; artifacts do not.
        for split in pkg.code_splits() {
            let split_name = split.split_name.as_deref();
            keep.profiles.push(paths::primary_ref_profile_path(
                &platform.config,
                &pkg.name,
                split_name,
            ));
            for &user_id in &user_ids {
                keep.profiles.push(paths::primary_cur_profile_path(
                    &platform.config,
                    user_id,
                    &pkg.name,
                    split_name,
                ));
            }
        }
        for info in registry.secondary_dex_info(&pkg.name) {
            keep.profiles
                .push(paths::secondary_ref_profile_path(&info.dex_path));
            keep.profiles
                .push(paths::secondary_cur_profile_path(&info.dex_path));
        }

        if platform.is_hibernating(&pkg.name) {
            continue;
        }

        let contexts = clc::derive_primary_contexts(pkg);
        for (split, context) in pkg.code_splits().iter().zip(contexts) {
            for abi in &pkg.abis {
                mark_one(
                    platform,
                    &mut keep,
                    &pkg.name,
                    &split.path,
                    &abi.isa,
                    &context,
                    true,
                )
                .await?;
            }
        }

        for info in registry
            .filtered_detailed_secondary_dex_info(&pkg.name)
            .await?
        {
            for abi in pkg.abis.iter().filter(|a| info.abi_names.contains(&a.name)) {
                mark_one(
                    platform,
                    &mut keep,
                    &pkg.name,
                    &info.dex_path,
                    &abi.isa,
                    &info.class_loader_context,
                    false,
                )
                .await?;
            }
        }
    }

    let freed = daemon
        .cleanup(&keep.profiles, &keep.artifacts, &keep.vdex, &keep.runtime)
        .await?;
    info!(freed_bytes = freed, "Artifact cleanup finished");
    Ok(freed)
}

async fn mark_one(
    platform: &Platform,
    keep: &mut KeepLists,
    package_name: &str,
    dex_path: &Path,
    isa: &str,
    class_loader_context: &str,
    is_primary: bool,
) -> Result<()> {
    let status = match platform
        .daemon
        .get_dexopt_status(dex_path, isa, class_loader_context)
        .await
    {
        Ok(status) => status,
        Err(e) if e.is_daemon_service_error() => {
            warn!(dex = ?dex_path, isa = %isa, error = %e, "Status probe failed, keeping nothing");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let artifacts = ArtifactsPath {
        dex_path: dex_path.to_path_buf(),
        isa: isa.to_string(),
        in_dalvik_cache: paths::is_in_dalvik_cache(&platform.config, dex_path),
    };
    let runtime = is_primary.then(|| RuntimeArtifactsPath {
        package_name: package_name.to_string(),
        dex_path: dex_path.to_path_buf(),
        isa: isa.to_string(),
    });
    keep.mark(&status.compiler_filter, artifacts, runtime);
    Ok(())
}
