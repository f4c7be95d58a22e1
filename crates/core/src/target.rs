//! Dexopt targets
//!
//! One trait over the two kinds of containers the planner can work on:
//! primary containers shipped with the package, and secondary containers
//! recorded by the dex-use registry. The planner only sees the trait.

use crate::clc::VARYING_CLASS_LOADER_CONTEXTS;
use crate::daemon::{CompilerDaemon, RuntimeArtifactsPath};
use crate::dex_use::SecondaryDexInfo;
use crate::errors::Result;
use crate::package::{PackageState, SplitInfo};
use crate::paths;
use crate::platform::ServiceConfig;
use crate::types::{Abi, PermissionSettings};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One container as the planner sees it.
#[async_trait]
pub trait DexoptTarget: Send + Sync {
    fn package_name(&self) -> &str;
    fn dex_path(&self) -> &Path;

    /// Whether this container can be compiled at all. A non-dexoptable
    /// container is skipped before any planning.
    fn is_dexoptable(&self) -> bool;

    /// `None` when the context is unknown or conflicting; optimized modes
    /// are then out of reach.
    fn class_loader_context(&self) -> Option<&str>;

    /// The context string as sent to the daemon, marker values included.
    fn wire_class_loader_context(&self) -> &str;

    fn abis(&self) -> &[Abi];

    fn is_in_dalvik_cache(&self) -> bool;

    /// Whether an app image may be generated alongside the code.
    fn is_app_image_allowed(&self) -> bool;

    /// Artifacts must be world-readable because another app (or an isolated
    /// process) executes this container.
    fn needs_to_be_shared(&self) -> bool;

    /// Whether external profile sources (prebuilt, DM) exist for this kind
    /// of container.
    fn has_external_profiles(&self) -> bool;

    fn ref_profile_path(&self) -> PathBuf;

    fn cur_profile_paths(&self) -> Vec<PathBuf>;

    fn dm_path(&self) -> Option<PathBuf>;

    fn permission_settings(&self, can_be_public: bool) -> PermissionSettings;

    /// The runtime-image slot for an ISA, for container kinds that have
    /// one.
    fn runtime_artifacts(&self, isa: &str) -> Option<RuntimeArtifactsPath>;

    /// Whether the container file itself is world-readable.
    async fn is_dex_file_public(&self, daemon: &Arc<dyn CompilerDaemon>) -> Result<bool>;
}

/// A primary container (base or split) of an installed package.
pub struct PrimaryTarget {
    package_name: String,
    dex_path: PathBuf,
    has_code: bool,
    class_loader_context: String,
    abis: Vec<Abi>,
    in_dalvik_cache: bool,
    needs_shared: bool,
    shared_gid: u32,
    app_image_allowed: bool,
    ref_profile: PathBuf,
    cur_profiles: Vec<PathBuf>,
    dm: PathBuf,
}

impl PrimaryTarget {
    pub fn new(
        config: &ServiceConfig,
        pkg: &PackageState,
        split: &SplitInfo,
        class_loader_context: String,
        user_ids: &[u32],
        needs_shared: bool,
    ) -> Self {
        let split_name = split.split_name.as_deref();
        PrimaryTarget {
            package_name: pkg.name.clone(),
            dex_path: split.path.clone(),
            has_code: split.has_code,
            class_loader_context,
            abis: pkg.abis.clone(),
            in_dalvik_cache: paths::is_in_dalvik_cache(config, &split.path),
            needs_shared,
            shared_gid: pkg.shared_gid(),
            app_image_allowed: !pkg.request_embedded_dex,
            ref_profile: paths::primary_ref_profile_path(config, &pkg.name, split_name),
            cur_profiles: user_ids
                .iter()
                .map(|&u| paths::primary_cur_profile_path(config, u, &pkg.name, split_name))
                .collect(),
            dm: paths::dm_path(&split.path),
        }
    }
}

#[async_trait]
impl DexoptTarget for PrimaryTarget {
    fn package_name(&self) -> &str {
        &self.package_name
    }

    fn dex_path(&self) -> &Path {
        &self.dex_path
    }

    fn is_dexoptable(&self) -> bool {
        self.has_code
    }

    fn class_loader_context(&self) -> Option<&str> {
        Some(&self.class_loader_context)
    }

    fn wire_class_loader_context(&self) -> &str {
        &self.class_loader_context
    }

    fn abis(&self) -> &[Abi] {
        &self.abis
    }

    fn is_in_dalvik_cache(&self) -> bool {
        self.in_dalvik_cache
    }

    fn is_app_image_allowed(&self) -> bool {
        self.app_image_allowed
    }

    fn needs_to_be_shared(&self) -> bool {
        self.needs_shared
    }

    fn has_external_profiles(&self) -> bool {
        true
    }

    fn ref_profile_path(&self) -> PathBuf {
        self.ref_profile.clone()
    }

    fn cur_profile_paths(&self) -> Vec<PathBuf> {
        self.cur_profiles.clone()
    }

    fn dm_path(&self) -> Option<PathBuf> {
        Some(self.dm.clone())
    }

    fn permission_settings(&self, can_be_public: bool) -> PermissionSettings {
        PermissionSettings::for_outputs(self.shared_gid, can_be_public)
    }

    fn runtime_artifacts(&self, isa: &str) -> Option<RuntimeArtifactsPath> {
        Some(RuntimeArtifactsPath {
            package_name: self.package_name.clone(),
            dex_path: self.dex_path.clone(),
            isa: isa.to_string(),
        })
    }

    async fn is_dex_file_public(&self, daemon: &Arc<dyn CompilerDaemon>) -> Result<bool> {
        Ok(daemon
            .get_dex_file_visibility(&self.dex_path)
            .await?
            .is_other_readable())
    }
}

/// A secondary container reported through the dex-use registry.
pub struct SecondaryTarget {
    package_name: String,
    info: SecondaryDexInfo,
    abis: Vec<Abi>,
    shared_gid: u32,
}

impl SecondaryTarget {
    /// `info` must come from the filtered registry query so that the
    /// visibility bit and loader list are trustworthy. ABIs are the
    /// package's ABIs restricted to those the registry saw the container
    /// loaded with.
    pub fn new(pkg: &PackageState, info: SecondaryDexInfo) -> Self {
        let abis: Vec<Abi> = pkg
            .abis
            .iter()
            .filter(|a| info.abi_names.contains(&a.name))
            .cloned()
            .collect();
        SecondaryTarget {
            package_name: pkg.name.clone(),
            shared_gid: pkg.shared_gid(),
            abis,
            info,
        }
    }
}

#[async_trait]
impl DexoptTarget for SecondaryTarget {
    fn package_name(&self) -> &str {
        &self.package_name
    }

    fn dex_path(&self) -> &Path {
        &self.info.dex_path
    }

    fn is_dexoptable(&self) -> bool {
        // A varying context still allows verification; only a context we
        // cannot express at all rules the container out.
        self.info.class_loader_context != crate::clc::UNSUPPORTED_CLASS_LOADER_CONTEXT
    }

    fn class_loader_context(&self) -> Option<&str> {
        let clc = self.info.class_loader_context.as_str();
        if clc == VARYING_CLASS_LOADER_CONTEXTS
            || clc == crate::clc::UNSUPPORTED_CLASS_LOADER_CONTEXT
        {
            None
        } else {
            Some(clc)
        }
    }

    fn wire_class_loader_context(&self) -> &str {
        &self.info.class_loader_context
    }

    fn abis(&self) -> &[Abi] {
        &self.abis
    }

    fn is_in_dalvik_cache(&self) -> bool {
        false
    }

    fn is_app_image_allowed(&self) -> bool {
        false
    }

    fn needs_to_be_shared(&self) -> bool {
        self.info.is_used_by_other_apps
    }

    fn has_external_profiles(&self) -> bool {
        false
    }

    fn ref_profile_path(&self) -> PathBuf {
        paths::secondary_ref_profile_path(&self.info.dex_path)
    }

    fn cur_profile_paths(&self) -> Vec<PathBuf> {
        vec![paths::secondary_cur_profile_path(&self.info.dex_path)]
    }

    fn dm_path(&self) -> Option<PathBuf> {
        None
    }

    fn permission_settings(&self, can_be_public: bool) -> PermissionSettings {
        PermissionSettings::for_outputs(self.shared_gid, can_be_public)
    }

    fn runtime_artifacts(&self, _isa: &str) -> Option<RuntimeArtifactsPath> {
        None
    }

    async fn is_dex_file_public(&self, _daemon: &Arc<dyn CompilerDaemon>) -> Result<bool> {
        Ok(self.info.is_dex_file_public)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex_use::DexLoader;

    fn secondary_info(clc: &str, other_apps: bool) -> SecondaryDexInfo {
        SecondaryDexInfo {
            dex_path: PathBuf::from("/data/user/0/com.example/files/p.jar"),
            user_id: 0,
            class_loader_context: clc.to_string(),
            abi_names: vec!["arm64-v8a".to_string()],
            loaders: vec![DexLoader::new("com.example", false)],
            is_used_by_other_apps: other_apps,
            is_dex_file_public: false,
        }
    }

    #[test]
    fn test_primary_target_paths() {
        let config = ServiceConfig::default();
        let pkg = PackageState::new("com.example");
        let split = pkg.splits[0].clone();
        let target = PrimaryTarget::new(&config, &pkg, &split, "PCL[]".to_string(), &[0, 10], false);
        assert!(target.is_dexoptable());
        assert_eq!(target.class_loader_context(), Some("PCL[]"));
        assert_eq!(target.cur_profile_paths().len(), 2);
        assert_eq!(
            target.dm_path(),
            Some(PathBuf::from("/data/app/com.example/base.dm"))
        );
        assert!(target.runtime_artifacts("arm64").is_some());
    }

    #[test]
    fn test_secondary_target_context_markers() {
        let pkg = PackageState::new("com.example");
        let varying = SecondaryTarget::new(
            &pkg,
            secondary_info(crate::clc::VARYING_CLASS_LOADER_CONTEXTS, false),
        );
        assert!(varying.is_dexoptable());
        assert_eq!(varying.class_loader_context(), None);

        let unsupported = SecondaryTarget::new(
            &pkg,
            secondary_info(crate::clc::UNSUPPORTED_CLASS_LOADER_CONTEXT, false),
        );
        assert!(!unsupported.is_dexoptable());

        let normal = SecondaryTarget::new(&pkg, secondary_info("PCL[]", true));
        assert_eq!(normal.class_loader_context(), Some("PCL[]"));
        assert!(normal.needs_to_be_shared());
        assert!(normal.runtime_artifacts("arm64").is_none());
    }

    #[test]
    fn test_secondary_target_abi_restriction() {
        let mut pkg = PackageState::new("com.example");
        pkg.abis.push(Abi::new("armeabi-v7a", "arm", false));
        let target = SecondaryTarget::new(&pkg, secondary_info("PCL[]", false));
        assert_eq!(target.abis().len(), 1);
        assert_eq!(target.abis()[0].name, "arm64-v8a");
    }
}
