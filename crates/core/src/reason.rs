//! Compilation reasons and the reason/mode table
//!
//! Every dexopt request carries a *reason* string that identifies why the
//! work is being done (`install`, `bg-dexopt`, ...). The table in this module
//! maps each canonical reason to its default compiler mode, priority class,
//! flag set, and worker concurrency. Custom reasons are accepted in batch
//! overrides but must bring their own mode and priority.

use crate::errors::{DexoptError, Result};
use crate::platform::SystemProperties;
use crate::types::DexoptFlags;
use serde::{Deserialize, Serialize};

pub const REASON_FIRST_BOOT: &str = "first-boot";
pub const REASON_BOOT_AFTER_OTA: &str = "boot-after-ota";
pub const REASON_BOOT_AFTER_MAINLINE_UPDATE: &str = "boot-after-mainline-update";
pub const REASON_INSTALL: &str = "install";
pub const REASON_INSTALL_FAST: &str = "install-fast";
pub const REASON_INSTALL_BULK: &str = "install-bulk";
pub const REASON_INSTALL_BULK_SECONDARY: &str = "install-bulk-secondary";
pub const REASON_INSTALL_BULK_DOWNGRADED: &str = "install-bulk-downgraded";
pub const REASON_INSTALL_BULK_SECONDARY_DOWNGRADED: &str = "install-bulk-secondary-downgraded";
pub const REASON_BG_DEXOPT: &str = "bg-dexopt";
pub const REASON_INACTIVE: &str = "inactive";
pub const REASON_CMDLINE: &str = "cmdline";

/// All reasons the table knows about, in documentation order.
pub const CANONICAL_REASONS: &[&str] = &[
    REASON_FIRST_BOOT,
    REASON_BOOT_AFTER_OTA,
    REASON_BOOT_AFTER_MAINLINE_UPDATE,
    REASON_INSTALL,
    REASON_INSTALL_FAST,
    REASON_INSTALL_BULK,
    REASON_INSTALL_BULK_SECONDARY,
    REASON_INSTALL_BULK_DOWNGRADED,
    REASON_INSTALL_BULK_SECONDARY_DOWNGRADED,
    REASON_BG_DEXOPT,
    REASON_INACTIVE,
    REASON_CMDLINE,
];

/// Compiler mode (filter) lattice, declared worst to best.
///
/// The derived ordering is the comparison order used throughout the service:
/// when two artifacts are compared, the greater mode wins. `Noop` sits
/// outside the lattice; the planner returns an empty result for it and it
/// never reaches a comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum CompilerMode {
    Noop,
    Skip,
    AssumeVerified,
    Extract,
    #[default]
    Verify,
    SpaceProfile,
    Space,
    SpeedProfile,
    Speed,
    EverythingProfile,
    Everything,
}

impl CompilerMode {
    pub fn name(&self) -> &'static str {
        match self {
            CompilerMode::Noop => "noop",
            CompilerMode::Skip => "skip",
            CompilerMode::AssumeVerified => "assume-verified",
            CompilerMode::Extract => "extract",
            CompilerMode::Verify => "verify",
            CompilerMode::SpaceProfile => "space-profile",
            CompilerMode::Space => "space",
            CompilerMode::SpeedProfile => "speed-profile",
            CompilerMode::Speed => "speed",
            CompilerMode::EverythingProfile => "everything-profile",
            CompilerMode::Everything => "everything",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "noop" => Ok(CompilerMode::Noop),
            "skip" => Ok(CompilerMode::Skip),
            "assume-verified" => Ok(CompilerMode::AssumeVerified),
            "extract" => Ok(CompilerMode::Extract),
            "verify" => Ok(CompilerMode::Verify),
            "space-profile" => Ok(CompilerMode::SpaceProfile),
            "space" => Ok(CompilerMode::Space),
            "speed-profile" => Ok(CompilerMode::SpeedProfile),
            "speed" => Ok(CompilerMode::Speed),
            "everything-profile" => Ok(CompilerMode::EverythingProfile),
            "everything" => Ok(CompilerMode::Everything),
            other => Err(DexoptError::invalid_argument(format!(
                "unknown compiler mode \"{other}\""
            ))),
        }
    }

    /// Modes that consume an execution profile as compiler input.
    pub fn is_profile_guided(&self) -> bool {
        matches!(
            self,
            CompilerMode::SpaceProfile | CompilerMode::SpeedProfile | CompilerMode::EverythingProfile
        )
    }

    /// Modes that produce compiled code (as opposed to verification-only
    /// artifacts).
    pub fn is_optimized(&self) -> bool {
        matches!(
            self,
            CompilerMode::SpaceProfile
                | CompilerMode::Space
                | CompilerMode::SpeedProfile
                | CompilerMode::Speed
                | CompilerMode::EverythingProfile
                | CompilerMode::Everything
        )
    }

    /// Verification-level modes. Artifacts exist but carry no compiled code,
    /// so the runtime may still produce a runtime image next to them.
    pub fn is_non_optimized(&self) -> bool {
        matches!(
            self,
            CompilerMode::AssumeVerified | CompilerMode::Extract | CompilerMode::Verify
        )
    }

    /// The mode to fall back to when the package runs under VM safe mode or
    /// is debuggable: verification only, never ahead-of-time code.
    pub fn safe_mode_equivalent(&self) -> Self {
        if self.is_optimized() {
            CompilerMode::Verify
        } else {
            *self
        }
    }
}

impl std::fmt::Display for CompilerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Scheduling priority class forwarded to the compiler daemon.
///
/// Plain numeric so that callers with custom reasons can pick intermediate
/// values; the named constants cover the canonical reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PriorityClass(pub i32);

impl PriorityClass {
    pub const BOOT: PriorityClass = PriorityClass(100);
    pub const INTERACTIVE_FAST: PriorityClass = PriorityClass(80);
    pub const INTERACTIVE: PriorityClass = PriorityClass(60);
    pub const BACKGROUND: PriorityClass = PriorityClass(40);

    pub fn validate(&self) -> Result<()> {
        if (0..=100).contains(&self.0) {
            Ok(())
        } else {
            Err(DexoptError::invalid_argument(format!(
                "priority class {} out of range [0, 100]",
                self.0
            )))
        }
    }
}

/// Whether the reason is one of the batch reasons (boot reasons plus
/// `bg-dexopt`). Batch reasons select their default package list via the
/// batch driver; all other canonical reasons target a single package.
pub fn is_batch_reason(reason: &str) -> bool {
    matches!(
        reason,
        REASON_FIRST_BOOT | REASON_BOOT_AFTER_OTA | REASON_BOOT_AFTER_MAINLINE_UPDATE
            | REASON_BG_DEXOPT
    )
}

/// Install reasons are recognized by prefix so that host-side installers can
/// mint variants without a table change.
pub fn is_install_reason(reason: &str) -> bool {
    reason.starts_with("install")
}

/// Default compiler mode for a canonical reason. Unknown reasons are an
/// invalid argument; callers with custom reasons must supply a mode
/// explicitly.
pub fn default_mode(reason: &str) -> Result<CompilerMode> {
    match reason {
        REASON_FIRST_BOOT | REASON_BOOT_AFTER_OTA | REASON_BOOT_AFTER_MAINLINE_UPDATE => {
            Ok(CompilerMode::Verify)
        }
        REASON_INSTALL | REASON_INSTALL_BULK => Ok(CompilerMode::SpeedProfile),
        REASON_INSTALL_FAST => Ok(CompilerMode::Skip),
        REASON_INSTALL_BULK_SECONDARY | REASON_INSTALL_BULK_DOWNGRADED => Ok(CompilerMode::Verify),
        REASON_INSTALL_BULK_SECONDARY_DOWNGRADED => Ok(CompilerMode::Extract),
        REASON_BG_DEXOPT => Ok(CompilerMode::SpeedProfile),
        REASON_INACTIVE => Ok(CompilerMode::Verify),
        REASON_CMDLINE => Ok(CompilerMode::Verify),
        other => Err(DexoptError::invalid_argument(format!(
            "no default compiler mode for reason \"{other}\""
        ))),
    }
}

/// Default priority class for a canonical reason.
pub fn default_priority(reason: &str) -> Result<PriorityClass> {
    match reason {
        REASON_FIRST_BOOT | REASON_BOOT_AFTER_OTA | REASON_BOOT_AFTER_MAINLINE_UPDATE => {
            Ok(PriorityClass::BOOT)
        }
        REASON_INSTALL | REASON_INSTALL_FAST => Ok(PriorityClass::INTERACTIVE_FAST),
        REASON_INSTALL_BULK
        | REASON_INSTALL_BULK_SECONDARY
        | REASON_INSTALL_BULK_DOWNGRADED
        | REASON_INSTALL_BULK_SECONDARY_DOWNGRADED
        | REASON_CMDLINE => Ok(PriorityClass::INTERACTIVE),
        REASON_BG_DEXOPT | REASON_INACTIVE => Ok(PriorityClass::BACKGROUND),
        other => Err(DexoptError::invalid_argument(format!(
            "no default priority class for reason \"{other}\""
        ))),
    }
}

/// Default flag set for a canonical reason.
pub fn default_flags(reason: &str) -> Result<DexoptFlags> {
    match reason {
        REASON_FIRST_BOOT | REASON_BOOT_AFTER_OTA | REASON_BOOT_AFTER_MAINLINE_UPDATE => Ok(
            DexoptFlags::FOR_PRIMARY_DEX | DexoptFlags::SHOULD_INCLUDE_DEPENDENCIES,
        ),
        REASON_INSTALL | REASON_INSTALL_FAST | REASON_INSTALL_BULK
        | REASON_INSTALL_BULK_DOWNGRADED => Ok(DexoptFlags::FOR_PRIMARY_DEX),
        REASON_INSTALL_BULK_SECONDARY | REASON_INSTALL_BULK_SECONDARY_DOWNGRADED => {
            Ok(DexoptFlags::FOR_SECONDARY_DEX)
        }
        REASON_BG_DEXOPT => Ok(DexoptFlags::FOR_PRIMARY_DEX
            | DexoptFlags::FOR_SECONDARY_DEX
            | DexoptFlags::SHOULD_INCLUDE_DEPENDENCIES
            | DexoptFlags::SKIP_IF_STORAGE_LOW),
        REASON_INACTIVE => Ok(DexoptFlags::FOR_PRIMARY_DEX
            | DexoptFlags::FOR_SECONDARY_DEX
            | DexoptFlags::SHOULD_DOWNGRADE),
        REASON_CMDLINE => Ok(DexoptFlags::FOR_PRIMARY_DEX
            | DexoptFlags::FOR_SECONDARY_DEX
            | DexoptFlags::SHOULD_INCLUDE_DEPENDENCIES),
        other => Err(DexoptError::invalid_argument(format!(
            "no default flags for reason \"{other}\""
        ))),
    }
}

/// Worker-pool width for a batch run at this reason.
///
/// `pm.dexopt.<reason>.concurrency` overrides; the default is capped so a
/// background run never saturates every core. Always at least 1.
pub fn concurrency(reason: &str, props: &dyn SystemProperties) -> usize {
    let default = num_cpus::get().min(4);
    let value = props
        .get(&format!("pm.dexopt.{reason}.concurrency"))
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default as i64);
    value.max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MapProperties;

    #[test]
    fn test_table_is_total_for_canonical_reasons() {
        for reason in CANONICAL_REASONS {
            default_mode(reason).unwrap();
            default_priority(reason).unwrap();
            default_flags(reason).unwrap();
        }
    }

    #[test]
    fn test_unknown_reason_is_invalid_argument() {
        assert!(matches!(
            default_mode("made-up"),
            Err(DexoptError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_mode_lattice_order() {
        assert!(CompilerMode::Skip < CompilerMode::Verify);
        assert!(CompilerMode::Verify < CompilerMode::SpeedProfile);
        assert!(CompilerMode::SpeedProfile < CompilerMode::Speed);
        assert!(CompilerMode::Speed < CompilerMode::Everything);
    }

    #[test]
    fn test_mode_subsets() {
        assert!(CompilerMode::SpeedProfile.is_profile_guided());
        assert!(CompilerMode::SpeedProfile.is_optimized());
        assert!(!CompilerMode::Verify.is_optimized());
        assert!(CompilerMode::Verify.is_non_optimized());
        assert!(!CompilerMode::Skip.is_non_optimized());
    }

    #[test]
    fn test_safe_mode_equivalent() {
        assert_eq!(
            CompilerMode::Speed.safe_mode_equivalent(),
            CompilerMode::Verify
        );
        assert_eq!(
            CompilerMode::Extract.safe_mode_equivalent(),
            CompilerMode::Extract
        );
    }

    #[test]
    fn test_mode_name_round_trip() {
        for mode in [
            CompilerMode::Skip,
            CompilerMode::Verify,
            CompilerMode::SpeedProfile,
            CompilerMode::Everything,
        ] {
            assert_eq!(CompilerMode::from_name(mode.name()).unwrap(), mode);
        }
    }

    #[test]
    fn test_concurrency_at_least_one() {
        let props = MapProperties::default();
        for reason in CANONICAL_REASONS {
            assert!(concurrency(reason, &props) >= 1);
        }
    }

    #[test]
    fn test_concurrency_sysprop_override() {
        let props = MapProperties::with(&[("pm.dexopt.bg-dexopt.concurrency", "2")]);
        assert_eq!(concurrency(REASON_BG_DEXOPT, &props), 2);

        // Nonsense values fall back and are clamped.
        let props = MapProperties::with(&[("pm.dexopt.bg-dexopt.concurrency", "-3")]);
        assert_eq!(concurrency(REASON_BG_DEXOPT, &props), 1);
    }

    #[test]
    fn test_batch_and_install_predicates() {
        assert!(is_batch_reason(REASON_BG_DEXOPT));
        assert!(is_batch_reason(REASON_FIRST_BOOT));
        assert!(!is_batch_reason(REASON_INSTALL));
        assert!(is_install_reason(REASON_INSTALL_BULK_SECONDARY));
        assert!(!is_install_reason(REASON_INACTIVE));
    }
}
