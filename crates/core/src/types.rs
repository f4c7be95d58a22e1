//! Shared value types: ABIs, dexopt flags, permission settings, and the
//! per-call parameter bundle.

use crate::errors::{DexoptError, Result};
use crate::reason::{self, CompilerMode, PriorityClass};
use serde::{Deserialize, Serialize};

/// An application binary interface a package can run under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Abi {
    /// ABI name as apps see it, e.g. `arm64-v8a`.
    pub name: String,
    /// Instruction-set identifier the compiler daemon keys artifacts by,
    /// e.g. `arm64`.
    pub isa: String,
    /// Exactly one ABI per package is primary.
    pub is_primary: bool,
}

impl Abi {
    pub fn new(name: impl Into<String>, isa: impl Into<String>, is_primary: bool) -> Self {
        Abi {
            name: name.into(),
            isa: isa.into(),
            is_primary,
        }
    }
}

/// Behavior flags for a dexopt request.
///
/// A plain bitset; combine with `|`. `validate` rejects contradictory
/// combinations up front so the planner never sees them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
pub struct DexoptFlags(pub u32);

impl DexoptFlags {
    pub const EMPTY: DexoptFlags = DexoptFlags(0);
    /// Operate on containers shipped in the package.
    pub const FOR_PRIMARY_DEX: DexoptFlags = DexoptFlags(1 << 0);
    /// Operate on containers the app dropped into its data directory.
    pub const FOR_SECONDARY_DEX: DexoptFlags = DexoptFlags(1 << 1);
    /// Expand the package list over `uses-library` edges.
    pub const SHOULD_INCLUDE_DEPENDENCIES: DexoptFlags = DexoptFlags(1 << 2);
    /// Replace better artifacts with the requested (worse) mode.
    pub const SHOULD_DOWNGRADE: DexoptFlags = DexoptFlags(1 << 3);
    /// Redo the work even if existing artifacts are up to date.
    pub const FORCE: DexoptFlags = DexoptFlags(1 << 4);
    /// Skip containers whose storage volume has no allocatable space.
    pub const SKIP_IF_STORAGE_LOW: DexoptFlags = DexoptFlags(1 << 5);
    /// Compile as if no profile existed.
    pub const IGNORE_PROFILE: DexoptFlags = DexoptFlags(1 << 6);
    /// Restrict primary dexopt to the split named in the params.
    pub const FOR_SINGLE_SPLIT: DexoptFlags = DexoptFlags(1 << 7);

    pub fn contains(&self, other: DexoptFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: DexoptFlags) -> DexoptFlags {
        DexoptFlags(self.0 | other.0)
    }

    pub fn without(self, other: DexoptFlags) -> DexoptFlags {
        DexoptFlags(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for DexoptFlags {
    type Output = DexoptFlags;
    fn bitor(self, rhs: DexoptFlags) -> DexoptFlags {
        DexoptFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for DexoptFlags {
    fn bitor_assign(&mut self, rhs: DexoptFlags) {
        self.0 |= rhs.0;
    }
}

/// Ownership and mode bits for one filesystem node the daemon creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsPermission {
    pub uid: u32,
    pub gid: u32,
    pub is_other_readable: bool,
    pub is_other_executable: bool,
}

/// Permission settings for a dexopt output tree: the containing directory
/// and the artifact files inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSettings {
    pub dir: FsPermission,
    pub file: FsPermission,
}

/// The uid the service itself runs as; output directories are always owned
/// by it.
pub const SYSTEM_UID: u32 = 1000;

impl PermissionSettings {
    /// Settings for artifacts of a package whose files carry `shared_gid`.
    /// Directories stay traversable for everyone so that world-readable
    /// files inside remain reachable; the file bit follows `can_be_public`.
    pub fn for_outputs(shared_gid: u32, can_be_public: bool) -> Self {
        PermissionSettings {
            dir: FsPermission {
                uid: SYSTEM_UID,
                gid: SYSTEM_UID,
                is_other_readable: false,
                is_other_executable: true,
            },
            file: FsPermission {
                uid: SYSTEM_UID,
                gid: shared_gid,
                is_other_readable: can_be_public,
                is_other_executable: false,
            },
        }
    }
}

/// Parameters for one dexopt request, single package or batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexoptParams {
    pub reason: String,
    pub mode: CompilerMode,
    pub priority: PriorityClass,
    pub flags: DexoptFlags,
    /// Split to operate on; requires `FOR_SINGLE_SPLIT`.
    pub split_name: Option<String>,
}

impl DexoptParams {
    /// Params for a canonical reason with the table defaults.
    pub fn for_reason(reason: &str) -> Result<Self> {
        Ok(DexoptParams {
            reason: reason.to_string(),
            mode: reason::default_mode(reason)?,
            priority: reason::default_priority(reason)?,
            flags: reason::default_flags(reason)?,
            split_name: None,
        })
    }

    /// Params for a custom reason. The caller owes us mode and priority
    /// because the table has no row to fall back on.
    pub fn for_custom_reason(
        reason: &str,
        mode: CompilerMode,
        priority: PriorityClass,
        flags: DexoptFlags,
    ) -> Result<Self> {
        priority.validate()?;
        let params = DexoptParams {
            reason: reason.to_string(),
            mode,
            priority,
            flags,
            split_name: None,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn with_mode(mut self, mode: CompilerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_flags(mut self, flags: DexoptFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_split(mut self, split_name: Option<String>) -> Self {
        self.split_name = split_name;
        if self.split_name.is_some() {
            self.flags |= DexoptFlags::FOR_SINGLE_SPLIT;
        }
        self
    }

    /// Reject contradictory flag combinations.
    pub fn validate(&self) -> Result<()> {
        let flags = self.flags;
        if !flags.contains(DexoptFlags::FOR_PRIMARY_DEX)
            && !flags.contains(DexoptFlags::FOR_SECONDARY_DEX)
        {
            return Err(DexoptError::invalid_argument(
                "neither primary nor secondary containers selected",
            ));
        }
        if flags.contains(DexoptFlags::FOR_SINGLE_SPLIT) {
            if self.split_name.is_none() {
                return Err(DexoptError::invalid_argument(
                    "FOR_SINGLE_SPLIT requires a split name",
                ));
            }
            if flags.contains(DexoptFlags::FOR_SECONDARY_DEX) {
                return Err(DexoptError::invalid_argument(
                    "FOR_SINGLE_SPLIT conflicts with FOR_SECONDARY_DEX",
                ));
            }
            if flags.contains(DexoptFlags::SHOULD_INCLUDE_DEPENDENCIES) {
                return Err(DexoptError::invalid_argument(
                    "FOR_SINGLE_SPLIT conflicts with SHOULD_INCLUDE_DEPENDENCIES",
                ));
            }
        } else if self.split_name.is_some() {
            return Err(DexoptError::invalid_argument(
                "split name given without FOR_SINGLE_SPLIT",
            ));
        }
        self.priority.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_algebra() {
        let flags = DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::FORCE;
        assert!(flags.contains(DexoptFlags::FORCE));
        assert!(!flags.contains(DexoptFlags::FOR_SECONDARY_DEX));
        assert!(flags
            .without(DexoptFlags::FORCE)
            .contains(DexoptFlags::FOR_PRIMARY_DEX));
    }

    #[test]
    fn test_params_for_reason() {
        let params = DexoptParams::for_reason("install").unwrap();
        assert_eq!(params.mode, CompilerMode::SpeedProfile);
        assert_eq!(params.priority, PriorityClass::INTERACTIVE_FAST);
        assert!(params.flags.contains(DexoptFlags::FOR_PRIMARY_DEX));
        params.validate().unwrap();
    }

    #[test]
    fn test_single_split_validation() {
        let params = DexoptParams::for_reason("install")
            .unwrap()
            .with_split(Some("config.arm64".to_string()));
        params.validate().unwrap();

        let mut bad = params.clone();
        bad.split_name = None;
        assert!(bad.validate().is_err());

        let bad = params
            .with_flags(
                DexoptFlags::FOR_SINGLE_SPLIT
                    | DexoptFlags::FOR_PRIMARY_DEX
                    | DexoptFlags::FOR_SECONDARY_DEX,
            );
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_no_container_set_is_invalid() {
        let params = DexoptParams::for_reason("install")
            .unwrap()
            .with_flags(DexoptFlags::FORCE);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_custom_reason_requires_valid_priority() {
        assert!(DexoptParams::for_custom_reason(
            "benchmark",
            CompilerMode::Speed,
            PriorityClass(250),
            DexoptFlags::FOR_PRIMARY_DEX,
        )
        .is_err());
    }

    #[test]
    fn test_shared_permission_settings() {
        let settings = PermissionSettings::for_outputs(10123, true);
        assert!(settings.file.is_other_readable);
        assert!(!settings.dir.is_other_readable);
        assert!(settings.dir.is_other_executable);
    }
}
