//! Profile acquisition
//!
//! Reference profiles are initialized from external sources (a prebuilt
//! profile shipped next to the container, else the profile embedded in the
//! DM file) into a temporary slot, and only promoted to the final slot after
//! a successful dexopt. [`TempRefProfile`] owns the temporary file: dropped
//! without a commit, it asks the daemon to delete it.

use crate::daemon::CompilerDaemon;
use crate::errors::Result;
use crate::paths;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A temporary reference profile owned by this process.
pub struct TempRefProfile {
    daemon: Arc<dyn CompilerDaemon>,
    path: PathBuf,
    defused: bool,
}

impl TempRefProfile {
    /// Reserve a temporary slot next to `final_path`.
    pub fn new(daemon: Arc<dyn CompilerDaemon>, final_path: &Path) -> Self {
        TempRefProfile {
            path: paths::tmp_profile_path(final_path),
            daemon,
            defused: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically promote the temporary profile into the final slot.
    pub async fn commit(mut self) -> Result<()> {
        self.daemon.commit_tmp_profile(&self.path).await?;
        self.defused = true;
        Ok(())
    }

    /// Delete the temporary profile now instead of at drop time.
    pub async fn discard(mut self) {
        if let Err(e) = self.daemon.delete_profile(&self.path).await {
            warn!(path = ?self.path, error = %e, "Failed to delete temporary profile");
        }
        self.defused = true;
    }
}

impl Drop for TempRefProfile {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        // Best-effort cleanup on abnormal exit paths; normal paths go
        // through commit or discard.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let daemon = self.daemon.clone();
            let path = self.path.clone();
            handle.spawn(async move {
                if let Err(e) = daemon.delete_profile(&path).await {
                    debug!(path = ?path, error = %e, "Leaked temporary profile");
                }
            });
        }
    }
}

/// Outcome of initializing a reference profile from external sources.
pub struct ExternalProfileInit {
    pub profile: Option<TempRefProfile>,
    /// One message per external profile that existed but was rejected.
    pub errors: Vec<String>,
}

/// Try the external profile sources for a container, best first. A rejected
/// source is recorded and the next one is tried; transport errors
/// propagate.
pub async fn init_reference_profile_from_external(
    daemon: &Arc<dyn CompilerDaemon>,
    dex_path: &Path,
    dm_path: Option<&Path>,
    final_ref_path: &Path,
) -> Result<ExternalProfileInit> {
    let mut errors = Vec::new();

    let mut sources: Vec<PathBuf> = vec![paths::prebuilt_profile_path(dex_path)];
    if let Some(dm) = dm_path {
        sources.push(dm.to_path_buf());
    }

    for src in sources {
        let tmp = TempRefProfile::new(daemon.clone(), final_ref_path);
        match daemon
            .copy_and_rewrite_profile(&src, tmp.path(), dex_path)
            .await
        {
            Ok(true) => {
                debug!(src = ?src, dex = ?dex_path, "Initialized reference profile");
                return Ok(ExternalProfileInit {
                    profile: Some(tmp),
                    errors,
                });
            }
            Ok(false) => {
                // No usable profile at this source.
                tmp.discard().await;
            }
            Err(e) if e.is_daemon_service_error() => {
                warn!(src = ?src, error = %e, "Rejected external profile");
                errors.push(format!("{src:?}: {e}"));
                tmp.discard().await;
            }
            Err(e) => {
                tmp.discard().await;
                return Err(e);
            }
        }
    }

    Ok(ExternalProfileInit {
        profile: None,
        errors,
    })
}

/// The profile input a planner settled on for one container.
pub enum PlannerProfile {
    /// The committed reference profile already in place.
    Existing {
        path: PathBuf,
        is_other_readable: bool,
    },
    /// A temporary profile to be committed after a successful dexopt.
    Temp {
        profile: TempRefProfile,
        is_other_readable: bool,
    },
}

impl PlannerProfile {
    pub fn path(&self) -> &Path {
        match self {
            PlannerProfile::Existing { path, .. } => path,
            PlannerProfile::Temp { profile, .. } => profile.path(),
        }
    }

    pub fn is_other_readable(&self) -> bool {
        match self {
            PlannerProfile::Existing {
                is_other_readable, ..
            }
            | PlannerProfile::Temp {
                is_other_readable, ..
            } => *is_other_readable,
        }
    }
}
