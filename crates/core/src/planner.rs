//! Per-container dexopt planner
//!
//! For one container the planner adjusts the requested compiler mode,
//! acquires a profile, decides output permissions, and then runs the
//! need-check / storage-guard / daemon-invocation sequence once per ABI.
//! Results come back as values; only invalid input, broken invariants, and
//! daemon transport faults surface as errors.

use crate::cancel::CancellationSignal;
use crate::daemon::{
    ArtifactsLocation, ArtifactsPath, DexoptCall, DexoptOptions, DexoptTrigger, OutputArtifacts,
    VdexPath,
};
use crate::errors::Result;
use crate::package::PackageState;
use crate::platform::Platform;
use crate::profile::{init_reference_profile_from_external, PlannerProfile, TempRefProfile};
use crate::reason::{self, CompilerMode, PriorityClass};
use crate::result::{ContainerDexoptResult, DexoptResultStatus, ExtendedStatusFlags};
use crate::target::DexoptTarget;
use crate::types::{DexoptFlags, DexoptParams};
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Plans and executes dexopt for single containers of one package.
pub struct ContainerPlanner<'a> {
    platform: &'a Platform,
    pkg: &'a PackageState,
    params: &'a DexoptParams,
    cancel: &'a CancellationSignal,
}

struct SelectedProfile {
    mode: CompilerMode,
    profile: Option<PlannerProfile>,
    merged: bool,
    external_errors: Vec<String>,
}

impl<'a> ContainerPlanner<'a> {
    pub fn new(
        platform: &'a Platform,
        pkg: &'a PackageState,
        params: &'a DexoptParams,
        cancel: &'a CancellationSignal,
    ) -> Self {
        ContainerPlanner {
            platform,
            pkg,
            params,
            cancel,
        }
    }

    /// Run the full planning sequence for one container across its ABIs.
    /// Entries appear in ABI order; a cancellation entry is always last.
    #[instrument(skip(self, target), fields(pkg = %self.pkg.name, dex = ?target.dex_path()))]
    pub async fn run(&self, target: &dyn DexoptTarget) -> Result<Vec<ContainerDexoptResult>> {
        let mode = self.adjust_mode(target);
        if mode == CompilerMode::Noop {
            debug!("Target mode is noop, nothing to do");
            return Ok(Vec::new());
        }

        let daemon = &self.platform.daemon;

        // A DM file only participates when it is actually visible.
        let dm_path: Option<PathBuf> = match target.dm_path() {
            Some(dm) => daemon
                .get_dm_file_visibility(&dm)
                .await?
                .is_found()
                .then_some(dm),
            None => None,
        };

        let selected = self.select_profile(target, mode, dm_path.as_deref()).await?;
        let SelectedProfile {
            mode,
            mut profile,
            merged,
            external_errors,
        } = selected;
        debug_assert!(profile.is_some() || !mode.is_profile_guided());

        let needs_shared = target.needs_to_be_shared();
        let dex_is_public = target.is_dex_file_public(daemon).await?;
        let profile_other_readable = profile.as_ref().map(|p| p.is_other_readable()).unwrap_or(true);
        let can_be_public = (!mode.is_profile_guided() || profile_other_readable) && dex_is_public;
        let permission_settings = target.permission_settings(can_be_public);

        let mut extended_flags = ExtendedStatusFlags::default();
        if !external_errors.is_empty() {
            extended_flags.insert(ExtendedStatusFlags::BAD_EXTERNAL_PROFILE);
        }

        let make_entry = |status: DexoptResultStatus, abi: &str| {
            let mut entry = ContainerDexoptResult::skipped(
                target.dex_path().to_path_buf(),
                abi,
                mode,
            );
            entry.status = status;
            entry.extended_flags = extended_flags;
            entry.external_profile_errors = external_errors.clone();
            entry
        };

        // Other apps execute this container, but its outputs cannot be made
        // world-readable. The container fails; later containers still run.
        if needs_shared && !can_be_public {
            warn!(
                dex = ?target.dex_path(),
                "Container is used by other apps but its outputs cannot be public"
            );
            let results: Vec<ContainerDexoptResult> = target
                .abis()
                .iter()
                .map(|abi| make_entry(DexoptResultStatus::Failed, &abi.name))
                .collect();
            self.finish(target, profile.take(), merged, &results).await;
            return Ok(results);
        }

        let mut results: Vec<ContainerDexoptResult> = Vec::new();
        'abis: for abi in target.abis() {
            if self.cancel.is_cancelled() {
                results.push(make_entry(DexoptResultStatus::Cancelled, &abi.name));
                break;
            }

            let artifacts = ArtifactsPath {
                dex_path: target.dex_path().to_path_buf(),
                isa: abi.isa.clone(),
                in_dalvik_cache: target.is_in_dalvik_cache(),
            };

            let trigger = match self
                .dexopt_trigger(&artifacts, needs_shared, merged)
                .await
            {
                Ok(trigger) => trigger,
                Err(e) if e.is_daemon_service_error() => {
                    warn!(abi = %abi.name, error = %e, "Trigger probe failed");
                    results.push(make_entry(DexoptResultStatus::Failed, &abi.name));
                    continue;
                }
                Err(e) => return Err(e),
            };

            let needed = match daemon
                .get_dexopt_needed(
                    target.dex_path(),
                    &abi.isa,
                    target.wire_class_loader_context(),
                    mode,
                    trigger,
                )
                .await
            {
                Ok(needed) => needed,
                Err(e) if e.is_daemon_service_error() => {
                    warn!(abi = %abi.name, error = %e, "Need check failed");
                    results.push(make_entry(DexoptResultStatus::Failed, &abi.name));
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !needed.has_dex_code {
                let mut entry = make_entry(DexoptResultStatus::Skipped, &abi.name);
                entry.extended_flags.insert(ExtendedStatusFlags::NO_DEX_CODE);
                results.push(entry);
                continue;
            }
            if !needed.is_dexopt_needed {
                results.push(make_entry(DexoptResultStatus::Skipped, &abi.name));
                continue;
            }

            if self.params.flags.contains(DexoptFlags::SKIP_IF_STORAGE_LOW) {
                let allocatable = self
                    .platform
                    .storage
                    .allocatable_bytes(&self.pkg.storage_uuid)?;
                if allocatable <= 0 {
                    info!(abi = %abi.name, "Skipping dexopt, storage low");
                    let mut entry = make_entry(DexoptResultStatus::Skipped, &abi.name);
                    entry.extended_flags.insert(ExtendedStatusFlags::STORAGE_LOW);
                    results.push(entry);
                    continue;
                }
            }

            let input_vdex = if needed.is_vdex_usable {
                match needed.artifacts_location {
                    // The DM is handed over separately.
                    ArtifactsLocation::Dm => None,
                    location => Some(VdexPath(ArtifactsPath {
                        dex_path: target.dex_path().to_path_buf(),
                        isa: abi.isa.clone(),
                        in_dalvik_cache: location == ArtifactsLocation::DalvikCache,
                    })),
                }
            } else {
                None
            };

            let call = DexoptCall {
                output: OutputArtifacts {
                    artifacts: artifacts.clone(),
                    permission_settings,
                },
                dex_path: target.dex_path().to_path_buf(),
                isa: abi.isa.clone(),
                class_loader_context: target.class_loader_context().map(str::to_string),
                mode,
                profile: profile.as_ref().map(|p| p.path().to_path_buf()),
                input_vdex,
                dm_path: dm_path.clone(),
                priority: self.params.priority,
                options: self.dexopt_options(target, profile.is_some(), dm_path.is_some()),
            };

            if self.cancel.is_cancelled() {
                results.push(make_entry(DexoptResultStatus::Cancelled, &abi.name));
                break;
            }

            let daemon_cancel = daemon.create_cancellation_signal().await?;
            let wired = daemon_cancel.clone();
            let listener = self.cancel.add_listener(move || wired.cancel());
            let outcome = daemon.dexopt(&call, &daemon_cancel).await;
            // Detach before the next ABI so a late cancel cannot leak into
            // an unrelated daemon call.
            drop(listener);

            match outcome {
                Ok(r) if r.cancelled => {
                    let mut entry = make_entry(DexoptResultStatus::Cancelled, &abi.name);
                    entry.wall_time_ms = r.wall_time_ms;
                    entry.cpu_time_ms = r.cpu_time_ms;
                    results.push(entry);
                    break 'abis;
                }
                Ok(r) => {
                    let mut entry = make_entry(DexoptResultStatus::Performed, &abi.name);
                    entry.wall_time_ms = r.wall_time_ms;
                    entry.cpu_time_ms = r.cpu_time_ms;
                    entry.size_bytes = r.size_bytes;
                    entry.size_before_bytes = r.size_before_bytes;
                    results.push(entry);
                }
                Err(e) if e.is_daemon_service_error() => {
                    warn!(abi = %abi.name, error = %e, "Dexopt failed");
                    results.push(make_entry(DexoptResultStatus::Failed, &abi.name));
                }
                Err(e) => return Err(e),
            }
        }

        self.finish(target, profile.take(), merged, &results).await;
        Ok(results)
    }

    /// Post-success bookkeeping: commit or discard the temporary profile,
    /// clear merged current profiles, drop stale runtime images.
    async fn finish(
        &self,
        target: &dyn DexoptTarget,
        profile: Option<PlannerProfile>,
        merged: bool,
        results: &[ContainerDexoptResult],
    ) {
        let daemon = &self.platform.daemon;
        let any_performed = results
            .iter()
            .any(|r| r.status == DexoptResultStatus::Performed);
        let observed_cancel = results
            .iter()
            .any(|r| r.status == DexoptResultStatus::Cancelled);

        let mut committed = false;
        match profile {
            Some(PlannerProfile::Temp { profile: tmp, .. }) => {
                if any_performed && !observed_cancel {
                    match tmp.commit().await {
                        Ok(()) => committed = true,
                        Err(e) => warn!(error = %e, "Failed to commit reference profile"),
                    }
                } else {
                    tmp.discard().await;
                }
            }
            Some(PlannerProfile::Existing { .. }) | None => {}
        }

        if committed && merged {
            // The runtime rebuilds current profiles on its next save; what
            // they held is folded into the committed reference now.
            for cur in target.cur_profile_paths() {
                if let Err(e) = daemon.delete_profile(&cur).await {
                    warn!(path = ?cur, error = %e, "Failed to delete current profile");
                }
            }
        }

        for entry in results
            .iter()
            .filter(|r| r.status == DexoptResultStatus::Performed)
        {
            let isa = target
                .abis()
                .iter()
                .find(|a| a.name == entry.abi)
                .map(|a| a.isa.clone())
                .unwrap_or_else(|| entry.abi.clone());
            if let Some(runtime) = target.runtime_artifacts(&isa) {
                if let Err(e) = daemon.delete_runtime_artifacts(&runtime).await {
                    debug!(error = %e, "Failed to delete stale runtime image");
                }
            }
        }
    }

    /// Mode adjustment: overrides first, then monotonic downgrades only.
    fn adjust_mode(&self, target: &dyn DexoptTarget) -> CompilerMode {
        let props = &self.platform.props;
        let config = &self.platform.config;
        let mut mode = self.params.mode;

        if self.pkg.name == config.system_ui_package {
            if let Some(value) = props.get("dalvik.vm.systemuicompilerfilter") {
                match CompilerMode::from_name(&value) {
                    Ok(m) => mode = m,
                    Err(_) => {
                        warn!(value = %value, "Ignoring bad system-ui compiler mode override")
                    }
                }
            }
        } else if config.launcher_package.as_deref() == Some(self.pkg.name.as_str()) {
            mode = CompilerMode::SpeedProfile;
        }

        if self.pkg.is_vm_safe_mode
            || self.pkg.is_debuggable
            || props.get_bool("dalvik.vm.always_debuggable", false)
        {
            mode = mode.safe_mode_equivalent();
        }
        if target.class_loader_context().is_none() && mode.is_optimized() {
            mode = CompilerMode::Verify;
        }
        if self.pkg.request_embedded_dex && mode.is_optimized() {
            mode = CompilerMode::Verify;
        }
        if self.params.flags.contains(DexoptFlags::IGNORE_PROFILE) && mode.is_profile_guided() {
            mode = CompilerMode::Verify;
        }
        mode
    }

    /// Profile acquisition for profile-guided modes; downgrades the mode
    /// when no profile can be produced.
    async fn select_profile(
        &self,
        target: &dyn DexoptTarget,
        mode: CompilerMode,
        dm_path: Option<&std::path::Path>,
    ) -> Result<SelectedProfile> {
        if !mode.is_profile_guided() {
            return Ok(SelectedProfile {
                mode,
                profile: None,
                merged: false,
                external_errors: Vec::new(),
            });
        }

        let daemon = &self.platform.daemon;
        let needs_shared = target.needs_to_be_shared();
        let mut external_errors = Vec::new();
        let mut profile: Option<PlannerProfile> = None;
        let mut merged = false;

        if needs_shared {
            // Shared outputs may only embed world-readable profile data, so
            // only external sources qualify.
            if target.has_external_profiles() {
                let init = init_reference_profile_from_external(
                    daemon,
                    target.dex_path(),
                    dm_path,
                    &target.ref_profile_path(),
                )
                .await?;
                external_errors.extend(init.errors);
                if let Some(tmp) = init.profile {
                    profile = Some(PlannerProfile::Temp {
                        profile: tmp,
                        is_other_readable: true,
                    });
                }
            }
        } else {
            let ref_path = target.ref_profile_path();
            let visibility = daemon.get_profile_visibility(&ref_path).await?;
            if visibility.is_found()
                && daemon.is_profile_usable(&ref_path, target.dex_path()).await?
            {
                profile = Some(PlannerProfile::Existing {
                    path: ref_path,
                    is_other_readable: visibility.is_other_readable(),
                });
            } else if target.has_external_profiles() {
                let init = init_reference_profile_from_external(
                    daemon,
                    target.dex_path(),
                    dm_path,
                    &target.ref_profile_path(),
                )
                .await?;
                external_errors.extend(init.errors);
                if let Some(tmp) = init.profile {
                    profile = Some(PlannerProfile::Temp {
                        profile: tmp,
                        is_other_readable: true,
                    });
                }
            }

            let cur_profiles = target.cur_profile_paths();
            if !cur_profiles.is_empty() {
                let merge_out = TempRefProfile::new(daemon.clone(), &target.ref_profile_path());
                let produced = daemon
                    .merge_profiles(
                        &cur_profiles,
                        profile.as_ref().map(|p| p.path()),
                        merge_out.path(),
                        &[target.dex_path().to_path_buf()],
                        &Default::default(),
                    )
                    .await?;
                if produced {
                    if let Some(PlannerProfile::Temp { profile: old, .. }) = profile.take() {
                        old.discard().await;
                    }
                    // Merged output contains per-user data, so it must not
                    // leak into shared artifacts.
                    profile = Some(PlannerProfile::Temp {
                        profile: merge_out,
                        is_other_readable: false,
                    });
                    merged = true;
                } else {
                    merge_out.discard().await;
                }
            }
        }

        let mode = if profile.is_some() {
            mode
        } else if needs_shared {
            shared_fallback_mode(&*self.platform.props)
        } else {
            CompilerMode::Verify
        };

        Ok(SelectedProfile {
            mode,
            profile,
            merged,
            external_errors,
        })
    }

    /// Conditions under which the need check should say yes.
    async fn dexopt_trigger(
        &self,
        artifacts: &ArtifactsPath,
        needs_shared: bool,
        profile_merged: bool,
    ) -> Result<DexoptTrigger> {
        let flags = self.params.flags;
        if flags.contains(DexoptFlags::FORCE) {
            return Ok(DexoptTrigger::COMPILER_FILTER_IS_BETTER
                | DexoptTrigger::COMPILER_FILTER_IS_SAME
                | DexoptTrigger::COMPILER_FILTER_IS_WORSE
                | DexoptTrigger::PRIMARY_BOOT_IMAGE_BECOMES_USABLE
                | DexoptTrigger::NEED_EXTRACTION);
        }
        if flags.contains(DexoptFlags::SHOULD_DOWNGRADE) {
            return Ok(DexoptTrigger::COMPILER_FILTER_IS_WORSE);
        }
        let mut trigger = DexoptTrigger::COMPILER_FILTER_IS_BETTER
            | DexoptTrigger::PRIMARY_BOOT_IMAGE_BECOMES_USABLE
            | DexoptTrigger::NEED_EXTRACTION;
        if profile_merged {
            trigger |= DexoptTrigger::COMPILER_FILTER_IS_SAME;
        }
        if needs_shared {
            let visibility = self
                .platform
                .daemon
                .get_artifacts_visibility(artifacts)
                .await?;
            if !visibility.is_other_readable() {
                // Existing private artifacts must be redone shared even at
                // the same or a worse mode.
                trigger |=
                    DexoptTrigger::COMPILER_FILTER_IS_SAME | DexoptTrigger::COMPILER_FILTER_IS_WORSE;
            }
        }
        Ok(trigger)
    }

    fn dexopt_options(
        &self,
        target: &dyn DexoptTarget,
        has_profile: bool,
        passes_dm: bool,
    ) -> DexoptOptions {
        let props = &self.platform.props;
        let compilation_reason = if passes_dm && reason::is_install_reason(&self.params.reason) {
            format!("{}-dm", self.params.reason)
        } else {
            self.params.reason.clone()
        };
        let variant = if self.params.priority >= PriorityClass::BOOT {
            "boot-"
        } else if self.params.priority <= PriorityClass::BACKGROUND {
            "background-"
        } else {
            ""
        };
        let app_image_format = props
            .get("dalvik.vm.appimageformat")
            .unwrap_or_default();
        DexoptOptions {
            compilation_reason,
            debuggable: self.pkg.is_debuggable
                || props.get_bool("dalvik.vm.always_debuggable", false),
            generate_app_image: target.is_app_image_allowed()
                && has_profile
                && !app_image_format.is_empty(),
            dex2oat_threads: props.get(&format!("dalvik.vm.{variant}dex2oat-threads")),
            dex2oat_cpu_set: props.get(&format!("dalvik.vm.{variant}dex2oat-cpu-set")),
        }
    }
}

/// Mode used for shared containers when no world-readable profile exists.
fn shared_fallback_mode(props: &dyn crate::platform::SystemProperties) -> CompilerMode {
    match props.get("pm.dexopt.shared") {
        Some(name) => match CompilerMode::from_name(&name) {
            Ok(mode) if !mode.is_profile_guided() => mode,
            _ => CompilerMode::Speed,
        },
        None => CompilerMode::Speed,
    }
}
