//! Compiler daemon client
//!
//! The daemon owns every artifact and profile on disk; the engine only
//! issues commands and observes visibility. This module defines the client
//! trait with the daemon's observable semantics and a subprocess-backed
//! implementation that talks to a helper binary.

mod subprocess;

pub use subprocess::SubprocessDaemon;

use crate::errors::Result;
use crate::reason::{CompilerMode, PriorityClass};
use crate::types::PermissionSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What the daemon can tell us about a file without opening it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileVisibility {
    NotFound,
    NotOtherReadable,
    OtherReadable,
}

impl FileVisibility {
    pub fn is_found(&self) -> bool {
        !matches!(self, FileVisibility::NotFound)
    }

    pub fn is_other_readable(&self) -> bool {
        matches!(self, FileVisibility::OtherReadable)
    }
}

/// Where existing artifacts for a container live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactsLocation {
    DalvikCache,
    NextToDex,
    /// The vdex is embedded in the container's DM file; it is passed to
    /// dexopt through the DM argument, not as an input vdex.
    Dm,
}

/// Conditions under which the daemon should consider dexopt needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DexoptTrigger(pub u32);

impl DexoptTrigger {
    /// Redo when the requested mode is better than the existing one.
    pub const COMPILER_FILTER_IS_BETTER: DexoptTrigger = DexoptTrigger(1 << 0);
    /// Redo even when the existing mode is the same.
    pub const COMPILER_FILTER_IS_SAME: DexoptTrigger = DexoptTrigger(1 << 1);
    /// Redo when the requested mode is worse (downgrade).
    pub const COMPILER_FILTER_IS_WORSE: DexoptTrigger = DexoptTrigger(1 << 2);
    /// Redo when a usable primary boot image appeared since the last run.
    pub const PRIMARY_BOOT_IMAGE_BECOMES_USABLE: DexoptTrigger = DexoptTrigger(1 << 3);
    /// Redo when dex code needs extraction from the container.
    pub const NEED_EXTRACTION: DexoptTrigger = DexoptTrigger(1 << 4);

    pub fn contains(&self, other: DexoptTrigger) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DexoptTrigger {
    type Output = DexoptTrigger;
    fn bitor(self, rhs: DexoptTrigger) -> DexoptTrigger {
        DexoptTrigger(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for DexoptTrigger {
    fn bitor_assign(&mut self, rhs: DexoptTrigger) {
        self.0 |= rhs.0;
    }
}

/// Reply to a need check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexoptNeededResult {
    pub is_dexopt_needed: bool,
    pub has_dex_code: bool,
    pub is_vdex_usable: bool,
    pub artifacts_location: ArtifactsLocation,
}

/// Status of existing artifacts for one (container, ISA).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexoptStatusInfo {
    pub compiler_filter: String,
    pub compilation_reason: String,
    pub location_debug_string: String,
}

/// Reply to a dexopt invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DaemonDexoptResult {
    pub cancelled: bool,
    pub wall_time_ms: i64,
    pub cpu_time_ms: i64,
    pub size_bytes: i64,
    pub size_before_bytes: i64,
}

/// Options for a profile merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeProfileOptions {
    pub force_merge: bool,
    pub for_boot_image: bool,
    pub dump_only: bool,
    pub dump_classes_and_methods: bool,
}

/// Opaque compilation options forwarded to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DexoptOptions {
    pub compilation_reason: String,
    pub debuggable: bool,
    pub generate_app_image: bool,
    /// `dalvik.vm.*dex2oat-threads` value for the chosen priority class.
    pub dex2oat_threads: Option<String>,
    /// `dalvik.vm.*dex2oat-cpu-set` value for the chosen priority class.
    pub dex2oat_cpu_set: Option<String>,
}

/// Identifies one set of compiled artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactsPath {
    pub dex_path: PathBuf,
    pub isa: String,
    pub in_dalvik_cache: bool,
}

/// Identifies one vdex file (same addressing as full artifacts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdexPath(pub ArtifactsPath);

/// Identifies one runtime-image slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeArtifactsPath {
    pub package_name: String,
    pub dex_path: PathBuf,
    pub isa: String,
}

/// Where and with which permissions dexopt writes its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputArtifacts {
    pub artifacts: ArtifactsPath,
    pub permission_settings: PermissionSettings,
}

/// Everything one dexopt invocation needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DexoptCall {
    pub output: OutputArtifacts,
    pub dex_path: PathBuf,
    pub isa: String,
    pub class_loader_context: Option<String>,
    pub mode: CompilerMode,
    pub profile: Option<PathBuf>,
    pub input_vdex: Option<VdexPath>,
    pub dm_path: Option<PathBuf>,
    pub priority: PriorityClass,
    pub options: DexoptOptions,
}

/// Handle for cancelling an in-flight daemon operation.
pub trait DaemonCancellation: Send + Sync {
    fn cancel(&self);

    /// Correlation token, for transports that need one.
    fn token(&self) -> Option<String> {
        None
    }
}

/// Client for the compiler daemon.
///
/// Errors split into two classes: `DaemonTransport` (the daemon is gone or
/// talking garbage; treated like an internal error) and `DaemonService`
/// (this particular input failed; callers log and skip the item).
#[async_trait]
pub trait CompilerDaemon: Send + Sync {
    async fn create_cancellation_signal(&self) -> Result<Arc<dyn DaemonCancellation>>;

    async fn get_dexopt_status(
        &self,
        dex_path: &Path,
        isa: &str,
        class_loader_context: &str,
    ) -> Result<DexoptStatusInfo>;

    async fn get_dexopt_needed(
        &self,
        dex_path: &Path,
        isa: &str,
        class_loader_context: &str,
        mode: CompilerMode,
        trigger: DexoptTrigger,
    ) -> Result<DexoptNeededResult>;

    async fn dexopt(
        &self,
        call: &DexoptCall,
        cancel: &Arc<dyn DaemonCancellation>,
    ) -> Result<DaemonDexoptResult>;

    async fn get_profile_visibility(&self, path: &Path) -> Result<FileVisibility>;
    async fn get_dex_file_visibility(&self, path: &Path) -> Result<FileVisibility>;
    async fn get_dm_file_visibility(&self, path: &Path) -> Result<FileVisibility>;
    async fn get_artifacts_visibility(&self, artifacts: &ArtifactsPath) -> Result<FileVisibility>;

    /// Copy `src` to `dst`, rewriting the embedded dex location to
    /// `dex_path`. Returns false when the source has no usable profile.
    async fn copy_and_rewrite_profile(
        &self,
        src: &Path,
        dst: &Path,
        dex_path: &Path,
    ) -> Result<bool>;

    async fn is_profile_usable(&self, profile: &Path, dex_path: &Path) -> Result<bool>;

    /// Merge `cur_profiles` (and `reference`, if given) into `output`.
    /// Returns false when the merge produced no content.
    async fn merge_profiles(
        &self,
        cur_profiles: &[PathBuf],
        reference: Option<&Path>,
        output: &Path,
        dex_paths: &[PathBuf],
        options: &MergeProfileOptions,
    ) -> Result<bool>;

    /// Atomically move a temporary reference profile into its final slot.
    async fn commit_tmp_profile(&self, tmp_profile: &Path) -> Result<()>;

    async fn delete_profile(&self, path: &Path) -> Result<()>;

    /// Returns freed bytes.
    async fn delete_artifacts(&self, artifacts: &ArtifactsPath) -> Result<i64>;

    /// Returns freed bytes.
    async fn delete_runtime_artifacts(&self, runtime: &RuntimeArtifactsPath) -> Result<i64>;

    /// Delete everything not named in the keep lists. Returns freed bytes.
    async fn cleanup(
        &self,
        profiles_to_keep: &[PathBuf],
        artifacts_to_keep: &[ArtifactsPath],
        vdex_to_keep: &[VdexPath],
        runtime_artifacts_to_keep: &[RuntimeArtifactsPath],
    ) -> Result<i64>;
}
