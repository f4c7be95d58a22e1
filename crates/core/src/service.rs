//! The dexopt service facade
//!
//! Owns the platform bundle, the dex-use registry, and the background job,
//! and exposes the operational surface: per-package and batch dexopt,
//! status queries, artifact/profile deletion, reset, and profile
//! snapshots. One instance per process; `install_global` enforces it.

use crate::batch::{
    self, BatchCallbacks, BatchOverride, BatchStartCallback, DoneCallback, ProgressCallback,
};
use crate::background::BackgroundDexoptJob;
use crate::cancel::CancellationSignal;
use crate::cleanup;
use crate::clc;
use crate::daemon::{ArtifactsPath, MergeProfileOptions, RuntimeArtifactsPath};
use crate::dex_use::DexUseRegistry;
use crate::dexopter;
use crate::errors::{DexoptError, Result};
use crate::package::Snapshot;
use crate::paths;
use crate::platform::Platform;
use crate::reason::REASON_INSTALL;
use crate::result::{BatchDexoptResult, PackageDexoptResult};
use crate::types::{DexoptFlags, DexoptParams};
use chrono::{TimeZone, Utc};
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use std::fmt::Write as _;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

static GLOBAL: OnceCell<Arc<DexoptService>> = OnceCell::new();

/// Status of one (container, ABI) pair as reported by the daemon. Probe
/// errors land in the string fields instead of failing the whole query.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DexoptStatusEntry {
    pub dex_path: PathBuf,
    pub abi: String,
    pub is_primary: bool,
    pub compiler_filter: String,
    pub compilation_reason: String,
    pub location_debug_string: String,
}

/// Process-wide dexopt coordinator.
pub struct DexoptService {
    platform: Platform,
    registry: Arc<DexUseRegistry>,
    callbacks: Arc<BatchCallbacks>,
    background_job: Arc<BackgroundDexoptJob>,
}

impl DexoptService {
    pub fn new(platform: Platform) -> Arc<Self> {
        let registry = Arc::new(DexUseRegistry::new(platform.clone()));
        let callbacks = Arc::new(BatchCallbacks::default());
        let background_job = Arc::new(BackgroundDexoptJob::new(
            platform.clone(),
            registry.clone(),
            callbacks.clone(),
        ));
        Arc::new(DexoptService {
            platform,
            registry,
            callbacks,
            background_job,
        })
    }

    /// Register the process-wide instance. A second registration is the
    /// well-known already-created error.
    pub fn install_global(service: Arc<Self>) -> Result<()> {
        GLOBAL
            .set(service)
            .map_err(|_| DexoptError::AlreadyCreated)
    }

    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn registry(&self) -> &Arc<DexUseRegistry> {
        &self.registry
    }

    pub fn background_job(&self) -> &Arc<BackgroundDexoptJob> {
        &self.background_job
    }

    /// Load persisted state; call once at startup.
    pub fn load_state(&self) -> Result<()> {
        self.registry.load()
    }

    /// Shutdown broadcast: flush the registry synchronously.
    pub async fn on_shutdown(&self) {
        self.registry.on_shutdown().await;
    }

    pub fn add_done_callback(&self, callback: DoneCallback) {
        self.callbacks
            .done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    pub fn clear_done_callbacks(&self) {
        self.callbacks
            .done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn set_batch_start_callback(&self, callback: BatchStartCallback) {
        *self
            .callbacks
            .batch_start
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub fn clear_batch_start_callback(&self) {
        *self
            .callbacks
            .batch_start
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Record dex loads reported by an app.
    pub fn notify_dex_containers_loaded(
        &self,
        loading_package: &str,
        isolated_process: bool,
        containers: &IndexMap<PathBuf, String>,
    ) -> Result<()> {
        let snapshot = self.platform.snapshots.snapshot()?;
        self.registry.notify_dex_containers_loaded(
            &snapshot,
            loading_package,
            isolated_process,
            containers,
        )
    }

    /// Dexopt one package.
    pub async fn dexopt_package(
        &self,
        package_name: &str,
        params: &DexoptParams,
        cancel: &CancellationSignal,
    ) -> Result<PackageDexoptResult> {
        let snapshot = self.platform.snapshots.snapshot()?;
        dexopter::dexopt_package(
            &self.platform,
            &self.registry,
            &snapshot,
            package_name,
            params,
            cancel,
        )
        .await
    }

    /// Batch dexopt. With no explicit list the reason's default selection
    /// applies, and the registered batch-start callback may adjust both the
    /// list and the params (but never the reason).
    pub async fn dexopt_packages(
        &self,
        reason: &str,
        explicit_packages: Option<Vec<String>>,
        explicit_params: Option<DexoptParams>,
        cancel: &CancellationSignal,
        progress: Option<ProgressCallback>,
    ) -> Result<BatchDexoptResult> {
        let snapshot = self.platform.snapshots.snapshot()?;
        let mut params = match explicit_params {
            Some(params) => params,
            None => DexoptParams::for_reason(reason)?,
        };
        let mut packages = match explicit_packages {
            Some(packages) => packages,
            None => batch::default_package_list(&self.platform, &self.registry, &snapshot, reason),
        };
        {
            let hook = self
                .callbacks
                .batch_start
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(hook) = hook.as_ref() {
                if let Some(BatchOverride {
                    packages: new_packages,
                    params: new_params,
                }) = hook(reason, &packages, &params)
                {
                    if let Some(new_packages) = new_packages {
                        packages = new_packages;
                    }
                    if let Some(new_params) = new_params {
                        if new_params.reason != reason {
                            return Err(DexoptError::invalid_argument(
                                "a batch-start callback cannot change the reason",
                            ));
                        }
                        params = new_params;
                    }
                }
            }
        }
        batch::dexopt_packages(
            &self.platform,
            &self.registry,
            &snapshot,
            packages,
            &params,
            cancel,
            progress,
            &self.callbacks.done_callbacks(),
        )
        .await
    }

    /// Run the janitor once.
    pub async fn cleanup(&self) -> Result<i64> {
        let snapshot = self.platform.snapshots.snapshot()?;
        cleanup::cleanup(&self.platform, &self.registry, &snapshot).await
    }

    /// Per-(container, ABI) dexopt status for the flag-selected container
    /// sets.
    #[instrument(skip(self))]
    pub async fn get_dexopt_status(
        &self,
        package_name: &str,
        flags: DexoptFlags,
    ) -> Result<Vec<DexoptStatusEntry>> {
        let snapshot = self.platform.snapshots.snapshot()?;
        let pkg = snapshot.expect_package(package_name)?;
        let mut entries = Vec::new();

        if flags.contains(DexoptFlags::FOR_PRIMARY_DEX) {
            let contexts = clc::derive_primary_contexts(pkg);
            for (split, context) in pkg.code_splits().iter().zip(contexts) {
                for abi in &pkg.abis {
                    entries.push(
                        self.status_entry(&split.path, abi, true, &context)
                            .await,
                    );
                }
            }
        }
        if flags.contains(DexoptFlags::FOR_SECONDARY_DEX) {
            for info in self
                .registry
                .filtered_detailed_secondary_dex_info(package_name)
                .await?
            {
                for abi in pkg.abis.iter().filter(|a| info.abi_names.contains(&a.name)) {
                    entries.push(
                        self.status_entry(&info.dex_path, abi, false, &info.class_loader_context)
                            .await,
                    );
                }
            }
        }
        Ok(entries)
    }

    async fn status_entry(
        &self,
        dex_path: &Path,
        abi: &crate::types::Abi,
        is_primary: bool,
        class_loader_context: &str,
    ) -> DexoptStatusEntry {
        match self
            .platform
            .daemon
            .get_dexopt_status(dex_path, &abi.isa, class_loader_context)
            .await
        {
            Ok(status) => DexoptStatusEntry {
                dex_path: dex_path.to_path_buf(),
                abi: abi.name.clone(),
                is_primary,
                compiler_filter: status.compiler_filter,
                compilation_reason: status.compilation_reason,
                location_debug_string: status.location_debug_string,
            },
            Err(e) => DexoptStatusEntry {
                dex_path: dex_path.to_path_buf(),
                abi: abi.name.clone(),
                is_primary,
                compiler_filter: "error".to_string(),
                compilation_reason: e.to_string(),
                location_debug_string: String::new(),
            },
        }
    }

    /// Delete compiled artifacts (and, for primary containers, runtime
    /// artifacts) of a package. Returns freed bytes.
    #[instrument(skip(self))]
    pub async fn delete_dexopt_artifacts(&self, package_name: &str) -> Result<i64> {
        let snapshot = self.platform.snapshots.snapshot()?;
        let pkg = snapshot.expect_package(package_name)?;
        let daemon = &self.platform.daemon;
        let mut freed = 0i64;

        for split in pkg.code_splits() {
            for abi in &pkg.abis {
                let artifacts = ArtifactsPath {
                    dex_path: split.path.clone(),
                    isa: abi.isa.clone(),
                    in_dalvik_cache: paths::is_in_dalvik_cache(&self.platform.config, &split.path),
                };
                match daemon.delete_artifacts(&artifacts).await {
                    Ok(bytes) => freed += bytes,
                    Err(e) if e.is_daemon_service_error() => {
                        warn!(dex = ?split.path, error = %e, "Failed to delete artifacts")
                    }
                    Err(e) => return Err(e),
                }
                let runtime = RuntimeArtifactsPath {
                    package_name: package_name.to_string(),
                    dex_path: split.path.clone(),
                    isa: abi.isa.clone(),
                };
                match daemon.delete_runtime_artifacts(&runtime).await {
                    Ok(bytes) => freed += bytes,
                    Err(e) if e.is_daemon_service_error() => {
                        warn!(dex = ?split.path, error = %e, "Failed to delete runtime artifacts")
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        for info in self.registry.secondary_dex_info(package_name) {
            for abi in pkg.abis.iter().filter(|a| info.abi_names.contains(&a.name)) {
                let artifacts = ArtifactsPath {
                    dex_path: info.dex_path.clone(),
                    isa: abi.isa.clone(),
                    in_dalvik_cache: false,
                };
                match daemon.delete_artifacts(&artifacts).await {
                    Ok(bytes) => freed += bytes,
                    Err(e) if e.is_daemon_service_error() => {
                        warn!(dex = ?info.dex_path, error = %e, "Failed to delete artifacts")
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        info!(freed_bytes = freed, "Deleted dexopt artifacts");
        Ok(freed)
    }

    /// Delete the reference and all current profiles of every container of
    /// a package.
    #[instrument(skip(self))]
    pub async fn clear_app_profiles(&self, package_name: &str) -> Result<()> {
        let snapshot = self.platform.snapshots.snapshot()?;
        let pkg = snapshot.expect_package(package_name)?;
        let daemon = &self.platform.daemon;
        let user_ids = self.platform.users.user_ids();

        for split in pkg.code_splits() {
            let split_name = split.split_name.as_deref();
            let mut profiles = vec![paths::primary_ref_profile_path(
                &self.platform.config,
                package_name,
                split_name,
            )];
            for &user_id in &user_ids {
                profiles.push(paths::primary_cur_profile_path(
                    &self.platform.config,
                    user_id,
                    package_name,
                    split_name,
                ));
            }
            for profile in profiles {
                if let Err(e) = daemon.delete_profile(&profile).await {
                    warn!(path = ?profile, error = %e, "Failed to delete profile");
                }
            }
        }
        for info in self.registry.secondary_dex_info(package_name) {
            for profile in [
                paths::secondary_ref_profile_path(&info.dex_path),
                paths::secondary_cur_profile_path(&info.dex_path),
            ] {
                if let Err(e) = daemon.delete_profile(&profile).await {
                    warn!(path = ?profile, error = %e, "Failed to delete profile");
                }
            }
        }
        Ok(())
    }

    /// Reset a package to its freshly-installed dexopt state: drop
    /// artifacts and profiles, then re-run an install-reason dexopt so any
    /// DM-embedded vdex or profile is materialized again.
    pub async fn reset_dexopt_status(
        &self,
        package_name: &str,
        cancel: &CancellationSignal,
    ) -> Result<PackageDexoptResult> {
        self.delete_dexopt_artifacts(package_name).await?;
        self.clear_app_profiles(package_name).await?;
        let params = DexoptParams::for_reason(REASON_INSTALL)?
            .with_flags(DexoptFlags::FOR_PRIMARY_DEX);
        self.dexopt_package(package_name, &params, cancel).await
    }

    /// Merge a package's profiles into a read-only handle. The backing
    /// file is deleted before returning, so the handle is the only
    /// reference left.
    pub async fn snapshot_app_profile(
        &self,
        package_name: &str,
        split_name: Option<&str>,
    ) -> Result<File> {
        let options = MergeProfileOptions {
            force_merge: true,
            ..Default::default()
        };
        self.merge_app_profile(package_name, split_name, &options)
            .await
    }

    /// Like `snapshot_app_profile` but rendered in the daemon's text dump
    /// format.
    pub async fn dump_app_profile(
        &self,
        package_name: &str,
        split_name: Option<&str>,
        dump_classes_and_methods: bool,
    ) -> Result<File> {
        let options = MergeProfileOptions {
            force_merge: true,
            dump_only: !dump_classes_and_methods,
            dump_classes_and_methods,
            ..Default::default()
        };
        self.merge_app_profile(package_name, split_name, &options)
            .await
    }

    async fn merge_app_profile(
        &self,
        package_name: &str,
        split_name: Option<&str>,
        options: &MergeProfileOptions,
    ) -> Result<File> {
        let snapshot = self.platform.snapshots.snapshot()?;
        let pkg = snapshot.expect_package(package_name)?;
        let split = pkg.split(split_name).ok_or_else(|| {
            DexoptError::invalid_argument(format!(
                "unknown split {split_name:?} in package \"{package_name}\""
            ))
        })?;
        let dex_path = split.path.clone();
        let user_ids = self.platform.users.user_ids();

        let cur_profiles: Vec<PathBuf> = user_ids
            .iter()
            .map(|&u| {
                paths::primary_cur_profile_path(&self.platform.config, u, package_name, split_name)
            })
            .collect();
        let reference =
            paths::primary_ref_profile_path(&self.platform.config, package_name, split_name);

        self.merge_to_handle(&cur_profiles, Some(&reference), &[dex_path], options)
            .await
            .map_err(|e| DexoptError::SnapshotFailed {
                message: format!("profile snapshot of \"{package_name}\" failed"),
                source: Some(Box::new(e)),
            })
    }

    /// Aggregate every boot-classpath-relevant profile on the device into
    /// one merged handle.
    pub async fn snapshot_boot_image_profile(&self) -> Result<File> {
        let snapshot = self.platform.snapshots.snapshot()?;
        let user_ids = self.platform.users.user_ids();
        let config = &self.platform.config;
        let mut profiles: Vec<PathBuf> = Vec::new();

        // The platform package's own profiles lead.
        profiles.push(paths::primary_ref_profile_path(
            config,
            &config.platform_package,
            None,
        ));
        for &user_id in &user_ids {
            profiles.push(paths::primary_cur_profile_path(
                config,
                user_id,
                &config.platform_package,
                None,
            ));
        }

        // Every code-bearing package contributes; hibernation does not
        // exclude profiles.
        for pkg in snapshot.packages.values() {
            for split in pkg.code_splits() {
                let split_name = split.split_name.as_deref();
                profiles.push(paths::primary_ref_profile_path(config, &pkg.name, split_name));
                for &user_id in &user_ids {
                    profiles.push(paths::primary_cur_profile_path(
                        config,
                        user_id,
                        &pkg.name,
                        split_name,
                    ));
                }
            }
        }

        let mut dex_paths: Vec<PathBuf> = Vec::new();
        for var in [
            "BOOTCLASSPATH",
            "SYSTEMSERVERCLASSPATH",
            "STANDALONE_SYSTEMSERVER_JARS",
        ] {
            if let Some(value) = self.platform.props.env(var) {
                dex_paths.extend(value.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
            }
        }

        let options = MergeProfileOptions {
            force_merge: true,
            for_boot_image: true,
            ..Default::default()
        };
        self.merge_to_handle(&profiles, None, &dex_paths, &options)
            .await
            .map_err(|e| DexoptError::SnapshotFailed {
                message: "boot image profile snapshot failed".to_string(),
                source: Some(Box::new(e)),
            })
    }

    async fn merge_to_handle(
        &self,
        cur_profiles: &[PathBuf],
        reference: Option<&Path>,
        dex_paths: &[PathBuf],
        options: &MergeProfileOptions,
    ) -> Result<File> {
        let output = self
            .platform
            .config
            .tmp_dir
            .join(format!("dexopt-snapshot-{:08x}.prof", fastrand::u32(..)));
        let produced = self
            .platform
            .daemon
            .merge_profiles(cur_profiles, reference, &output, dex_paths, options)
            .await?;
        if !produced {
            // Callers always get a readable handle, possibly empty.
            File::create(&output)?;
        }
        let handle = File::open(&output)?;
        if let Err(e) = std::fs::remove_file(&output) {
            warn!(path = ?output, error = %e, "Failed to unlink snapshot backing file");
        }
        Ok(handle)
    }

    /// Human-readable state dump for one package or the whole device.
    pub async fn dump(&self, package_name: Option<&str>) -> Result<String> {
        let snapshot = self.platform.snapshots.snapshot()?;
        let packages: Vec<&str> = match package_name {
            Some(name) => {
                snapshot.expect_package(name)?;
                vec![name]
            }
            None => snapshot.packages.keys().map(String::as_str).collect(),
        };

        let mut out = String::new();
        for name in packages {
            let _ = writeln!(out, "[{name}]");
            let entries = self
                .get_dexopt_status(
                    name,
                    DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FOR_SECONDARY_DEX,
                )
                .await?;
            for entry in entries {
                let _ = writeln!(
                    out,
                    "  {} ({}): {} / {} [{}]",
                    entry.dex_path.display(),
                    entry.abi,
                    entry.compiler_filter,
                    entry.compilation_reason,
                    entry.location_debug_string
                );
            }
            let last_used = self.registry.package_last_used_ms(name);
            if last_used > 0 {
                let _ = writeln!(out, "  last used: {}", format_ms(last_used));
            }
            for info in self.registry.secondary_dex_info(name) {
                let _ = writeln!(
                    out,
                    "  secondary {} (user {}): clc {}, abis {:?}",
                    info.dex_path.display(),
                    info.user_id,
                    info.class_loader_context,
                    info.abi_names
                );
                for loader in &info.loaders {
                    let _ = writeln!(
                        out,
                        "    loaded by {}{}",
                        loader.loading_package,
                        if loader.isolated_process {
                            " (isolated)"
                        } else {
                            ""
                        }
                    );
                }
            }
        }
        Ok(out)
    }
}

fn format_ms(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(ts) => ts.to_rfc3339(),
        None => format!("{ms} ms"),
    }
}
