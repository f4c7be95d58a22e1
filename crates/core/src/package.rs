//! Package metadata model
//!
//! A read-consistent snapshot of the host platform's package state, reduced
//! to what dexopt planning needs. The snapshot is immutable once taken;
//! long-running operations hold one `Arc<Snapshot>` for their whole run.

use crate::errors::{DexoptError, Result};
use crate::types::Abi;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One primary container of a package: the base APK or a split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitInfo {
    /// `None` for the base container.
    pub split_name: Option<String>,
    pub path: PathBuf,
    pub has_code: bool,
    /// Parent split for isolated split loading; `None` means the base.
    #[serde(default)]
    pub parent_split: Option<String>,
}

/// Dexopt-relevant state of one installed package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageState {
    pub name: String,
    /// Base container first, then splits in manifest order.
    pub splits: Vec<SplitInfo>,
    /// At least one entry; exactly one is primary.
    pub abis: Vec<Abi>,
    /// Names of shared libraries this package uses.
    #[serde(default)]
    pub uses_libraries: Vec<String>,
    #[serde(default)]
    pub is_debuggable: bool,
    #[serde(default)]
    pub is_vm_safe_mode: bool,
    /// The package asks the runtime to execute dex code embedded in the APK
    /// rather than extracted artifacts.
    #[serde(default)]
    pub request_embedded_dex: bool,
    /// Manifest split-loading form; see `clc::derive_primary_contexts`.
    #[serde(default)]
    pub isolated_split_loading: bool,
    /// Per-app id; artifact files carry it as their shared gid.
    #[serde(default = "default_app_id")]
    pub app_id: u32,
    /// Storage volume UUID the package's code lives on. Empty means the
    /// default internal volume.
    #[serde(default)]
    pub storage_uuid: String,
    /// Package-manager-reported last-use time per user, in ms since epoch.
    #[serde(default)]
    pub last_used_ms_by_user: IndexMap<u32, i64>,
}

fn default_app_id() -> u32 {
    10000
}

impl PackageState {
    /// A package with a single code-bearing base container and one primary
    /// ABI. Callers adjust fields as needed.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        PackageState {
            splits: vec![SplitInfo {
                split_name: None,
                path: PathBuf::from(format!("/data/app/{name}/base.apk")),
                has_code: true,
                parent_split: None,
            }],
            abis: vec![Abi::new("arm64-v8a", "arm64", true)],
            uses_libraries: Vec::new(),
            is_debuggable: false,
            is_vm_safe_mode: false,
            request_embedded_dex: false,
            isolated_split_loading: false,
            app_id: default_app_id(),
            storage_uuid: String::new(),
            last_used_ms_by_user: IndexMap::new(),
            name,
        }
    }

    pub fn has_code(&self) -> bool {
        self.splits.iter().any(|s| s.has_code)
    }

    /// Splits that carry code, in manifest order.
    pub fn code_splits(&self) -> Vec<&SplitInfo> {
        self.splits.iter().filter(|s| s.has_code).collect()
    }

    pub fn split(&self, split_name: Option<&str>) -> Option<&SplitInfo> {
        self.splits
            .iter()
            .find(|s| s.split_name.as_deref() == split_name)
    }

    pub fn primary_abi(&self) -> Option<&Abi> {
        self.abis.iter().find(|a| a.is_primary)
    }

    /// Whether `path` is one of this package's primary container paths.
    pub fn owns_primary_path(&self, path: &Path) -> bool {
        self.splits.iter().any(|s| s.path == path)
    }

    pub fn shared_gid(&self) -> u32 {
        self.app_id
    }

    /// Package-manager view of the last use across all users; 0 if never
    /// reported.
    pub fn last_used_ms(&self) -> i64 {
        self.last_used_ms_by_user.values().copied().max().unwrap_or(0)
    }
}

/// A shared library known to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLibrary {
    pub name: String,
    /// Package providing the library, when the library is APK-packaged.
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub is_apk: bool,
    #[serde(default)]
    pub is_native: bool,
    /// Library names this library itself depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Immutable package-state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub packages: IndexMap<String, PackageState>,
    #[serde(default)]
    pub libraries: IndexMap<String, SharedLibrary>,
}

impl Snapshot {
    pub fn package(&self, name: &str) -> Option<&PackageState> {
        self.packages.get(name)
    }

    /// Like `package` but an unknown name is the caller's mistake.
    pub fn expect_package(&self, name: &str) -> Result<&PackageState> {
        self.packages
            .get(name)
            .ok_or_else(|| DexoptError::invalid_argument(format!("unknown package \"{name}\"")))
    }

    pub fn library(&self, name: &str) -> Option<&SharedLibrary> {
        self.libraries.get(name)
    }

    pub fn is_library_provider(&self, package_name: &str) -> bool {
        self.libraries
            .values()
            .any(|l| l.package_name.as_deref() == Some(package_name))
    }

    pub fn load_from_file(path: &Path) -> Result<Snapshot> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| DexoptError::invalid_argument(format!("bad snapshot {path:?}: {e}")))
    }
}

/// Source of read-consistent snapshots.
pub trait SnapshotProvider: Send + Sync {
    fn snapshot(&self) -> Result<Arc<Snapshot>>;
}

/// Provider over a fixed in-memory snapshot.
pub struct FixedSnapshot(pub Arc<Snapshot>);

impl FixedSnapshot {
    pub fn new(snapshot: Snapshot) -> Self {
        FixedSnapshot(Arc::new(snapshot))
    }
}

impl SnapshotProvider for FixedSnapshot {
    fn snapshot(&self) -> Result<Arc<Snapshot>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_package_has_code() {
        let pkg = PackageState::new("com.example.app");
        assert!(pkg.has_code());
        assert_eq!(pkg.code_splits().len(), 1);
        assert!(pkg.owns_primary_path(Path::new("/data/app/com.example.app/base.apk")));
        assert!(pkg.primary_abi().is_some());
    }

    #[test]
    fn test_last_used_max_over_users() {
        let mut pkg = PackageState::new("com.example.app");
        assert_eq!(pkg.last_used_ms(), 0);
        pkg.last_used_ms_by_user.insert(0, 100);
        pkg.last_used_ms_by_user.insert(10, 900);
        assert_eq!(pkg.last_used_ms(), 900);
    }

    #[test]
    fn test_expect_package_unknown_is_invalid_argument() {
        let snapshot = Snapshot::default();
        assert!(matches!(
            snapshot.expect_package("nope"),
            Err(DexoptError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_library_provider() {
        let mut snapshot = Snapshot::default();
        snapshot.libraries.insert(
            "com.example.lib".to_string(),
            SharedLibrary {
                name: "com.example.lib".to_string(),
                package_name: Some("com.example.libpkg".to_string()),
                is_apk: true,
                is_native: false,
                dependencies: Vec::new(),
            },
        );
        assert!(snapshot.is_library_provider("com.example.libpkg"));
        assert!(!snapshot.is_library_provider("com.example.app"));
    }

    #[test]
    fn test_snapshot_json_round_trip() {
        let mut snapshot = Snapshot::default();
        snapshot
            .packages
            .insert("a".to_string(), PackageState::new("a"));
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
