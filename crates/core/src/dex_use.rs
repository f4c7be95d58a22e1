//! Dex-use registry
//!
//! Records which app loaded which container under which class-loader
//! context. Apps report loads through `notify_dex_containers_loaded`; the
//! planner consults the records to decide whether artifacts must be shared
//! and which secondary containers exist; the janitor prunes records whose
//! files or packages are gone.
//!
//! State lives behind one mutex and is persisted to a single file, written
//! debounced through a temp-file-plus-rename replace. Visibility probes
//! never run under the lock.

use crate::clc::{
    self, UNSUPPORTED_CLASS_LOADER_CONTEXT, VARYING_CLASS_LOADER_CONTEXTS,
};
use crate::daemon::{CompilerDaemon, FileVisibility};
use crate::debounce::Debouncer;
use crate::errors::{DexoptError, Result};
use crate::package::Snapshot;
use crate::paths;
use crate::platform::Platform;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// File name under the persistent directory.
pub const DEX_USE_FILE_NAME: &str = "dex-use.bin";

const FILE_VERSION: u32 = 1;
const SAVE_QUIET_WINDOW: Duration = Duration::from_secs(15);

/// Identity of a process that loaded a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DexLoader {
    pub loading_package: String,
    pub isolated_process: bool,
}

impl DexLoader {
    pub fn new(loading_package: impl Into<String>, isolated_process: bool) -> Self {
        DexLoader {
            loading_package: loading_package.into(),
            isolated_process,
        }
    }

    /// An other-app loader forces world-readable artifacts: either a
    /// different package, or an isolated process (which can only read
    /// world-readable files, even of its own app).
    pub fn is_other_app(&self, owning_package: &str) -> bool {
        self.loading_package != owning_package || self.isolated_process
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PrimaryLoad {
    last_used_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SecondaryLoad {
    last_used_ms: i64,
    class_loader_context: String,
    abi_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PrimaryUse {
    loaders: IndexMap<DexLoader, PrimaryLoad>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SecondaryUse {
    /// User whose data directory holds the file.
    user_id: u32,
    loaders: IndexMap<DexLoader, SecondaryLoad>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PackageDexUse {
    primary: IndexMap<PathBuf, PrimaryUse>,
    secondary: IndexMap<PathBuf, SecondaryUse>,
}

impl PackageDexUse {
    fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty()
    }
}

/// On-disk shape: one top-level message.
#[derive(Debug, Serialize, Deserialize)]
struct DexUseFile {
    version: u32,
    packages: IndexMap<String, PackageDexUse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedDataDirs {
    storage_uuid: String,
    ce: PathBuf,
    de: PathBuf,
}

#[derive(Default)]
struct State {
    packages: IndexMap<String, PackageDexUse>,
    /// Bumped on every visible change; compared against the last committed
    /// revision to decide whether a save is due.
    revision: u64,
    data_dir_cache: HashMap<(String, u32), CachedDataDirs>,
}

/// Everything known about one secondary container of a package.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryDexInfo {
    pub dex_path: PathBuf,
    pub user_id: u32,
    /// Collapsed context across the considered loaders; one of the marker
    /// constants when absent or conflicting.
    pub class_loader_context: String,
    /// Distinct ABI names, insertion order.
    pub abi_names: Vec<String>,
    pub loaders: Vec<DexLoader>,
    pub is_used_by_other_apps: bool,
    /// Only meaningful from the filtered query; the unfiltered one does
    /// not probe.
    pub is_dex_file_public: bool,
}

/// Persistent registry of observed dex loads.
pub struct DexUseRegistry {
    state: Mutex<State>,
    last_committed: Mutex<u64>,
    save_serial: tokio::sync::Mutex<()>,
    file_path: PathBuf,
    platform: Platform,
    debouncer: Debouncer,
}

impl DexUseRegistry {
    pub fn new(platform: Platform) -> Self {
        let file_path = platform.config.persist_dir.join(DEX_USE_FILE_NAME);
        DexUseRegistry {
            state: Mutex::new(State::default()),
            last_committed: Mutex::new(0),
            save_serial: tokio::sync::Mutex::new(()),
            file_path,
            platform,
            debouncer: Debouncer::new(SAVE_QUIET_WINDOW),
        }
    }

    fn daemon(&self) -> &Arc<dyn CompilerDaemon> {
        &self.platform.daemon
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that `loading_package` loaded each container with the given
    /// class-loader context. Containers that belong to no known package are
    /// ignored (shared libraries, foreign jars).
    pub fn notify_dex_containers_loaded(
        self: &Arc<Self>,
        snapshot: &Snapshot,
        loading_package: &str,
        isolated_process: bool,
        containers: &IndexMap<PathBuf, String>,
    ) -> Result<()> {
        if loading_package == self.platform.config.platform_package {
            return Err(DexoptError::invalid_argument(
                "the platform package does not report dex loads",
            ));
        }
        let loading_state = snapshot.expect_package(loading_package)?;
        for (path, context) in containers {
            clc::validate_dex_path(path)?;
            clc::validate_class_loader_context(context)?;
            if context == VARYING_CLASS_LOADER_CONTEXTS {
                return Err(DexoptError::invalid_argument(
                    "a load notification cannot carry the varying-contexts marker",
                ));
            }
        }

        let now_ms = self.platform.clock.now_ms();
        let loader = DexLoader::new(loading_package, isolated_process);
        let abi_name = loading_state
            .primary_abi()
            .map(|a| a.name.clone())
            .unwrap_or_default();
        let user_ids = self.platform.users.user_ids();

        let mut state = self.lock();
        let mut changed = false;
        for (path, context) in containers {
            let owner = resolve_owner(
                &mut state,
                &self.platform,
                snapshot,
                loading_state,
                &user_ids,
                path,
            );
            match owner {
                Some(ContainerOwner::Primary { owner }) => {
                    let entry = state
                        .packages
                        .entry(owner)
                        .or_default()
                        .primary
                        .entry(path.clone())
                        .or_default();
                    entry.loaders.insert(
                        loader.clone(),
                        PrimaryLoad {
                            last_used_ms: now_ms,
                        },
                    );
                    changed = true;
                }
                Some(ContainerOwner::Secondary { user_id }) => {
                    let entry = state
                        .packages
                        .entry(loading_package.to_string())
                        .or_default()
                        .secondary
                        .entry(path.clone())
                        .or_insert_with(|| SecondaryUse {
                            user_id,
                            loaders: IndexMap::new(),
                        });
                    entry.loaders.insert(
                        loader.clone(),
                        SecondaryLoad {
                            last_used_ms: now_ms,
                            class_loader_context: context.clone(),
                            abi_name: abi_name.clone(),
                        },
                    );
                    changed = true;
                }
                None => {
                    debug!(path = ?path, loader = %loading_package, "Ignoring unowned container load");
                }
            }
        }
        if changed {
            state.revision += 1;
            drop(state);
            self.request_save();
        }
        Ok(())
    }

    /// Loaders observed for a primary container.
    pub fn primary_dex_loaders(&self, package_name: &str, dex_path: &Path) -> Vec<DexLoader> {
        let state = self.lock();
        state
            .packages
            .get(package_name)
            .and_then(|p| p.primary.get(dex_path))
            .map(|u| u.loaders.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_primary_dex_used_by_other_apps(&self, package_name: &str, dex_path: &Path) -> bool {
        self.primary_dex_loaders(package_name, dex_path)
            .iter()
            .any(|l| l.is_other_app(package_name))
    }

    /// Latest observed use of any of the package's containers, 0 if none.
    pub fn package_last_used_ms(&self, package_name: &str) -> i64 {
        let state = self.lock();
        let Some(pkg) = state.packages.get(package_name) else {
            return 0;
        };
        let primary = pkg
            .primary
            .values()
            .flat_map(|u| u.loaders.values())
            .map(|l| l.last_used_ms);
        let secondary = pkg
            .secondary
            .values()
            .flat_map(|u| u.loaders.values())
            .map(|l| l.last_used_ms);
        primary.chain(secondary).max().unwrap_or(0)
    }

    /// Secondary container records of a package, with no visibility
    /// filtering.
    pub fn secondary_dex_info(&self, package_name: &str) -> Vec<SecondaryDexInfo> {
        let state = self.lock();
        let Some(pkg) = state.packages.get(package_name) else {
            return Vec::new();
        };
        pkg.secondary
            .iter()
            .map(|(path, entry)| {
                secondary_info(package_name, path, entry, |_| true, true)
            })
            .collect()
    }

    /// Secondary container records with files probed: missing files are
    /// dropped, and for files that are not world-readable only same-app
    /// loaders are considered.
    pub async fn filtered_detailed_secondary_dex_info(
        &self,
        package_name: &str,
    ) -> Result<Vec<SecondaryDexInfo>> {
        let entries: Vec<(PathBuf, SecondaryUse)> = {
            let state = self.lock();
            match state.packages.get(package_name) {
                Some(pkg) => pkg
                    .secondary
                    .iter()
                    .map(|(p, e)| (p.clone(), e.clone()))
                    .collect(),
                None => return Ok(Vec::new()),
            }
        };

        let mut infos = Vec::new();
        for (path, entry) in entries {
            let visibility = self.daemon().get_dex_file_visibility(&path).await?;
            if !visibility.is_found() {
                continue;
            }
            let is_public = visibility.is_other_readable();
            let info = secondary_info(
                package_name,
                &path,
                &entry,
                |loader| is_public || !loader.is_other_app(package_name),
                is_public,
            );
            if info.loaders.is_empty() {
                continue;
            }
            infos.push(info);
        }
        Ok(infos)
    }

    /// Drop records whose owning or loading package is gone, whose file has
    /// vanished, or whose other-app loaders lost read access. Returns
    /// whether anything changed.
    pub async fn cleanup(self: &Arc<Self>, live_packages: &HashSet<String>) -> Result<bool> {
        // Pass 1, under the lock: enumerate paths to probe.
        let to_probe: Vec<PathBuf> = {
            let state = self.lock();
            state
                .packages
                .values()
                .flat_map(|p| p.primary.keys().chain(p.secondary.keys()).cloned())
                .collect()
        };

        // Pass 2, no lock: probe.
        let mut visibility = HashMap::new();
        for path in to_probe {
            let v = self.daemon().get_dex_file_visibility(&path).await?;
            visibility.insert(path, v);
        }

        // Pass 3, under the lock: prune.
        let mut changed = false;
        {
            let mut state = self.lock();
            state.packages.retain(|owner, _| {
                let live = live_packages.contains(owner);
                changed |= !live;
                live
            });
            for (owner, pkg) in state.packages.iter_mut() {
                let prune_container = |path: &PathBuf| -> bool {
                    match visibility.get(path) {
                        Some(v) if !v.is_found() => true,
                        // Not probed: added after pass 1; keep.
                        _ => false,
                    }
                };
                pkg.primary.retain(|path, entry| {
                    if prune_container(path) {
                        changed = true;
                        return false;
                    }
                    let world_readable = visibility
                        .get(path)
                        .map(|v| v.is_other_readable())
                        .unwrap_or(true);
                    entry.loaders.retain(|loader, _| {
                        let keep = live_packages.contains(&loader.loading_package)
                            && (world_readable || !loader.is_other_app(owner));
                        changed |= !keep;
                        keep
                    });
                    !entry.loaders.is_empty()
                });
                pkg.secondary.retain(|path, entry| {
                    if prune_container(path) {
                        changed = true;
                        return false;
                    }
                    let world_readable = visibility
                        .get(path)
                        .map(|v| v.is_other_readable())
                        .unwrap_or(true);
                    entry.loaders.retain(|loader, _| {
                        let keep = live_packages.contains(&loader.loading_package)
                            && (world_readable || !loader.is_other_app(owner));
                        changed |= !keep;
                        keep
                    });
                    !entry.loaders.is_empty()
                });
            }
            state.packages.retain(|_, pkg| !pkg.is_empty());
            if changed {
                state.revision += 1;
            }
        }
        if changed {
            self.request_save();
        }
        Ok(changed)
    }

    fn request_save(self: &Arc<Self>) {
        let this = self.clone();
        self.debouncer.maybe_run_async(async move {
            if let Err(e) = this.save().await {
                warn!(error = %e, "Deferred dex-use save failed");
            }
        });
    }

    /// Write the current state out if it is newer than what is on disk.
    /// Serialization happens under the state lock; the file replace does
    /// not.
    pub async fn save(&self) -> Result<()> {
        let _serial = self.save_serial.lock().await;
        let (bytes, revision) = {
            let state = self.lock();
            let committed = *self.last_committed.lock().unwrap_or_else(|e| e.into_inner());
            if state.revision <= committed {
                return Ok(());
            }
            let file = DexUseFile {
                version: FILE_VERSION,
                packages: state.packages.clone(),
            };
            let bytes = bincode::serialize(&file)
                .map_err(|e| DexoptError::internal(format!("dex-use encoding failed: {e}")))?;
            (bytes, state.revision)
        };

        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.file_path.with_extension("bin.tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &self.file_path)?;

        let mut committed = self.last_committed.lock().unwrap_or_else(|e| e.into_inner());
        if revision > *committed {
            *committed = revision;
        }
        debug!(path = ?self.file_path, revision, "Saved dex-use records");
        Ok(())
    }

    /// Load persisted records, dropping entries that fail validation.
    /// Missing file means a fresh start.
    pub fn load(&self) -> Result<()> {
        let bytes = match std::fs::read(&self.file_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let file: DexUseFile = match bincode::deserialize(&bytes) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = ?self.file_path, error = %e, "Discarding unreadable dex-use file");
                return Ok(());
            }
        };
        if file.version != FILE_VERSION {
            warn!(
                version = file.version,
                "Discarding dex-use file with unsupported version"
            );
            return Ok(());
        }

        let mut packages = file.packages;
        for pkg in packages.values_mut() {
            pkg.primary.retain(|path, entry| {
                if clc::validate_dex_path(path).is_err() {
                    warn!(path = ?path, "Dropping primary record with invalid path");
                    return false;
                }
                entry.loaders.retain(|_, load| load.last_used_ms > 0);
                !entry.loaders.is_empty()
            });
            pkg.secondary.retain(|path, entry| {
                if clc::validate_dex_path(path).is_err() {
                    warn!(path = ?path, "Dropping secondary record with invalid path");
                    return false;
                }
                entry.loaders.retain(|_, load| {
                    load.last_used_ms > 0
                        && !load.abi_name.is_empty()
                        && clc::validate_class_loader_context(&load.class_loader_context).is_ok()
                });
                !entry.loaders.is_empty()
            });
        }
        packages.retain(|_, pkg| !pkg.is_empty());

        let mut state = self.lock();
        let count = packages.len();
        state.packages = packages;
        state.revision = 0;
        *self.last_committed.lock().unwrap_or_else(|e| e.into_inner()) = 0;
        info!(packages = count, "Loaded dex-use records");
        Ok(())
    }

    /// Shutdown path: flush synchronously, skipping the debounce window.
    pub async fn on_shutdown(&self) {
        self.debouncer.cancel();
        if let Err(e) = self.save().await {
            warn!(error = %e, "Failed to save dex-use records at shutdown");
        }
    }

    /// Current in-memory revision, for tests and dumps.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }
}

enum ContainerOwner {
    Primary { owner: String },
    Secondary { user_id: u32 },
}

fn resolve_owner(
    state: &mut State,
    platform: &Platform,
    snapshot: &Snapshot,
    loading_state: &crate::package::PackageState,
    user_ids: &[u32],
    path: &Path,
) -> Option<ContainerOwner> {
    // (i) The loader's own primary containers.
    if loading_state.owns_primary_path(path) {
        return Some(ContainerOwner::Primary {
            owner: loading_state.name.clone(),
        });
    }
    // (ii) Any other package's primary containers.
    for pkg in snapshot.packages.values() {
        if pkg.owns_primary_path(path) {
            return Some(ContainerOwner::Primary {
                owner: pkg.name.clone(),
            });
        }
    }
    // (iii) The loader's own data directories: a secondary container.
    for &user_id in user_ids {
        let key = (loading_state.name.clone(), user_id);
        let dirs = match state.data_dir_cache.get(&key) {
            Some(cached) if cached.storage_uuid == loading_state.storage_uuid => cached.clone(),
            _ => {
                let computed = CachedDataDirs {
                    storage_uuid: loading_state.storage_uuid.clone(),
                    ce: paths::ce_data_dir(
                        &platform.config,
                        &loading_state.storage_uuid,
                        user_id,
                        &loading_state.name,
                    ),
                    de: paths::de_data_dir(
                        &platform.config,
                        &loading_state.storage_uuid,
                        user_id,
                        &loading_state.name,
                    ),
                };
                state.data_dir_cache.insert(key, computed.clone());
                computed
            }
        };
        if path.starts_with(&dirs.ce) || path.starts_with(&dirs.de) {
            return Some(ContainerOwner::Secondary { user_id });
        }
    }
    // (iv) Nobody we track.
    None
}

fn secondary_info(
    owner: &str,
    path: &Path,
    entry: &SecondaryUse,
    retain: impl Fn(&DexLoader) -> bool,
    is_dex_file_public: bool,
) -> SecondaryDexInfo {
    let retained: Vec<(&DexLoader, &SecondaryLoad)> = entry
        .loaders
        .iter()
        .filter(|&(loader, _)| retain(loader))
        .collect();

    let mut contexts: Vec<&str> = Vec::new();
    let mut abi_names: Vec<String> = Vec::new();
    for (_, load) in &retained {
        if !contexts.contains(&load.class_loader_context.as_str()) {
            contexts.push(&load.class_loader_context);
        }
        if !abi_names.contains(&load.abi_name) {
            abi_names.push(load.abi_name.clone());
        }
    }
    let class_loader_context = if contexts
        .iter()
        .any(|c| *c == UNSUPPORTED_CLASS_LOADER_CONTEXT)
        || contexts.is_empty()
    {
        UNSUPPORTED_CLASS_LOADER_CONTEXT.to_string()
    } else if contexts.len() == 1 {
        contexts[0].to_string()
    } else {
        VARYING_CLASS_LOADER_CONTEXTS.to_string()
    };

    let loaders: Vec<DexLoader> = retained.iter().map(|(l, _)| (*l).clone()).collect();
    let is_used_by_other_apps = loaders.iter().any(|l| l.is_other_app(owner));
    SecondaryDexInfo {
        dex_path: path.to_path_buf(),
        user_id: entry.user_id,
        class_loader_context,
        abi_names,
        loaders,
        is_used_by_other_apps,
        is_dex_file_public,
    }
}
