//! Shared test support: a scriptable mock compiler daemon and platform
//! fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use dexopt_core::daemon::{
    ArtifactsLocation, ArtifactsPath, CompilerDaemon, DaemonCancellation, DaemonDexoptResult,
    DexoptCall, DexoptNeededResult, DexoptStatusInfo, DexoptTrigger, FileVisibility,
    MergeProfileOptions, RuntimeArtifactsPath, VdexPath,
};
use dexopt_core::errors::{DexoptError, Result};
use dexopt_core::package::{PackageState, Snapshot, SnapshotProvider};
use dexopt_core::platform::{
    Clock, HibernationManager, JobInfo, JobScheduler, MapProperties, NoopPowerManager, Platform,
    ServiceConfig, StaticUserManager, StorageManager,
};
use dexopt_core::reason::CompilerMode;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MergeCall {
    pub cur_profiles: Vec<PathBuf>,
    pub reference: Option<PathBuf>,
    pub output: PathBuf,
    pub dex_paths: Vec<PathBuf>,
    pub options: MergeProfileOptions,
}

/// Scripted daemon state. Configure before the run, inspect after.
#[derive(Default)]
pub struct MockDaemonState {
    // Configuration.
    pub dex_visibility: HashMap<PathBuf, FileVisibility>,
    pub profile_visibility: HashMap<PathBuf, FileVisibility>,
    pub dm_visibility: HashMap<PathBuf, FileVisibility>,
    pub artifacts_visibility: HashMap<PathBuf, FileVisibility>,
    /// copy_and_rewrite source paths that yield a profile.
    pub profile_sources: HashSet<PathBuf>,
    /// copy_and_rewrite source paths that fail with a service error.
    pub bad_profile_sources: HashSet<PathBuf>,
    /// Profiles `is_profile_usable` says yes to.
    pub usable_profiles: HashSet<PathBuf>,
    /// Whether merges produce output.
    pub merge_produces: bool,
    /// Need-check replies per dex path; unlisted paths get the default
    /// (needed, has code, no usable vdex).
    pub dexopt_needed: HashMap<PathBuf, DexoptNeededResult>,
    /// Status replies per dex path.
    pub dexopt_status: HashMap<PathBuf, DexoptStatusInfo>,
    /// Dex paths whose dexopt fails with a service error.
    pub fail_dexopt: HashSet<PathBuf>,
    /// How long each dexopt "runs"; cancellable while running.
    pub dexopt_duration: Option<Duration>,
    /// Bytes reported by the next cleanup call; consumed.
    pub cleanup_freed: i64,
    pub delete_artifacts_bytes: i64,

    // Recording.
    pub dexopt_calls: Vec<DexoptCall>,
    pub need_checks: Vec<(PathBuf, String, CompilerMode, DexoptTrigger)>,
    pub merge_calls: Vec<MergeCall>,
    pub committed_profiles: Vec<PathBuf>,
    pub deleted_profiles: Vec<PathBuf>,
    pub deleted_artifacts: Vec<ArtifactsPath>,
    pub deleted_runtime_artifacts: Vec<RuntimeArtifactsPath>,
    pub cleanup_calls: Vec<(usize, usize, usize, usize)>,
    pub op_log: Vec<String>,

    cancel_flags: HashMap<String, Arc<AtomicBool>>,
}

pub struct MockDaemon {
    pub state: Mutex<MockDaemonState>,
    next_token: AtomicU64,
}

impl MockDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(MockDaemon {
            state: Mutex::new(MockDaemonState::default()),
            next_token: AtomicU64::new(1),
        })
    }

    pub fn configure(&self, f: impl FnOnce(&mut MockDaemonState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn inspect<T>(&self, f: impl FnOnce(&MockDaemonState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }

    pub fn dexopt_count(&self) -> usize {
        self.inspect(|s| s.dexopt_calls.len())
    }

    fn log(&self, entry: String) {
        self.state.lock().unwrap().op_log.push(entry);
    }
}

struct MockCancellation {
    token: String,
    cancelled: Arc<AtomicBool>,
}

impl DaemonCancellation for MockCancellation {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}

fn default_needed() -> DexoptNeededResult {
    DexoptNeededResult {
        is_dexopt_needed: true,
        has_dex_code: true,
        is_vdex_usable: false,
        artifacts_location: ArtifactsLocation::NextToDex,
    }
}

#[async_trait]
impl CompilerDaemon for MockDaemon {
    async fn create_cancellation_signal(&self) -> Result<Arc<dyn DaemonCancellation>> {
        let token = format!("mock-{}", self.next_token.fetch_add(1, Ordering::Relaxed));
        let cancelled = Arc::new(AtomicBool::new(false));
        self.state
            .lock()
            .unwrap()
            .cancel_flags
            .insert(token.clone(), cancelled.clone());
        Ok(Arc::new(MockCancellation { token, cancelled }))
    }

    async fn get_dexopt_status(
        &self,
        dex_path: &Path,
        isa: &str,
        _class_loader_context: &str,
    ) -> Result<DexoptStatusInfo> {
        self.log(format!("get-dexopt-status {} {}", dex_path.display(), isa));
        let state = self.state.lock().unwrap();
        Ok(state
            .dexopt_status
            .get(dex_path)
            .cloned()
            .unwrap_or(DexoptStatusInfo {
                compiler_filter: "run-from-apk".to_string(),
                compilation_reason: "unknown".to_string(),
                location_debug_string: String::new(),
            }))
    }

    async fn get_dexopt_needed(
        &self,
        dex_path: &Path,
        isa: &str,
        _class_loader_context: &str,
        mode: CompilerMode,
        trigger: DexoptTrigger,
    ) -> Result<DexoptNeededResult> {
        let mut state = self.state.lock().unwrap();
        state
            .need_checks
            .push((dex_path.to_path_buf(), isa.to_string(), mode, trigger));
        state
            .op_log
            .push(format!("get-dexopt-needed {}", dex_path.display()));
        Ok(state
            .dexopt_needed
            .get(dex_path)
            .cloned()
            .unwrap_or_else(default_needed))
    }

    async fn dexopt(
        &self,
        call: &DexoptCall,
        cancel: &Arc<dyn DaemonCancellation>,
    ) -> Result<DaemonDexoptResult> {
        let (duration, fails, flag) = {
            let mut state = self.state.lock().unwrap();
            state.dexopt_calls.push(call.clone());
            state
                .op_log
                .push(format!("dexopt {} {}", call.dex_path.display(), call.isa));
            let flag = cancel
                .token()
                .and_then(|t| state.cancel_flags.get(&t).cloned());
            (
                state.dexopt_duration,
                state.fail_dexopt.contains(&call.dex_path),
                flag,
            )
        };
        if fails {
            return Err(DexoptError::DaemonService {
                operation: "dexopt".to_string(),
                message: format!("dex2oat failed for {}", call.dex_path.display()),
            });
        }

        let cancelled = || {
            flag.as_ref()
                .map(|f| f.load(Ordering::SeqCst))
                .unwrap_or(false)
        };

        if let Some(total) = duration {
            let started = std::time::Instant::now();
            loop {
                if cancelled() {
                    return Ok(DaemonDexoptResult {
                        cancelled: true,
                        wall_time_ms: started.elapsed().as_millis() as i64,
                        ..Default::default()
                    });
                }
                if started.elapsed() >= total {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        } else if cancelled() {
            return Ok(DaemonDexoptResult {
                cancelled: true,
                ..Default::default()
            });
        }

        Ok(DaemonDexoptResult {
            cancelled: false,
            wall_time_ms: 100,
            cpu_time_ms: 80,
            size_bytes: 1_000,
            size_before_bytes: 2_000,
        })
    }

    async fn get_profile_visibility(&self, path: &Path) -> Result<FileVisibility> {
        let state = self.state.lock().unwrap();
        Ok(state
            .profile_visibility
            .get(path)
            .copied()
            .unwrap_or(FileVisibility::NotFound))
    }

    async fn get_dex_file_visibility(&self, path: &Path) -> Result<FileVisibility> {
        let state = self.state.lock().unwrap();
        Ok(state
            .dex_visibility
            .get(path)
            .copied()
            .unwrap_or(FileVisibility::OtherReadable))
    }

    async fn get_dm_file_visibility(&self, path: &Path) -> Result<FileVisibility> {
        let state = self.state.lock().unwrap();
        Ok(state
            .dm_visibility
            .get(path)
            .copied()
            .unwrap_or(FileVisibility::NotFound))
    }

    async fn get_artifacts_visibility(&self, artifacts: &ArtifactsPath) -> Result<FileVisibility> {
        let state = self.state.lock().unwrap();
        Ok(state
            .artifacts_visibility
            .get(&artifacts.dex_path)
            .copied()
            .unwrap_or(FileVisibility::NotFound))
    }

    async fn copy_and_rewrite_profile(
        &self,
        src: &Path,
        dst: &Path,
        _dex_path: &Path,
    ) -> Result<bool> {
        self.log(format!(
            "copy-and-rewrite-profile {} -> {}",
            src.display(),
            dst.display()
        ));
        let state = self.state.lock().unwrap();
        if state.bad_profile_sources.contains(src) {
            return Err(DexoptError::DaemonService {
                operation: "copy-and-rewrite-profile".to_string(),
                message: format!("malformed profile at {}", src.display()),
            });
        }
        Ok(state.profile_sources.contains(src))
    }

    async fn is_profile_usable(&self, profile: &Path, _dex_path: &Path) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.usable_profiles.contains(profile))
    }

    async fn merge_profiles(
        &self,
        cur_profiles: &[PathBuf],
        reference: Option<&Path>,
        output: &Path,
        dex_paths: &[PathBuf],
        options: &MergeProfileOptions,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.merge_calls.push(MergeCall {
            cur_profiles: cur_profiles.to_vec(),
            reference: reference.map(Path::to_path_buf),
            output: output.to_path_buf(),
            dex_paths: dex_paths.to_vec(),
            options: *options,
        });
        if state.merge_produces {
            // Best effort; planner merges point at paths that only exist on
            // a real device, and the planner never reads the file itself.
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::write(output, b"merged-profile").ok();
        }
        Ok(state.merge_produces)
    }

    async fn commit_tmp_profile(&self, tmp_profile: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.committed_profiles.push(tmp_profile.to_path_buf());
        state
            .op_log
            .push(format!("commit-tmp-profile {}", tmp_profile.display()));
        Ok(())
    }

    async fn delete_profile(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deleted_profiles.push(path.to_path_buf());
        state
            .op_log
            .push(format!("delete-profile {}", path.display()));
        Ok(())
    }

    async fn delete_artifacts(&self, artifacts: &ArtifactsPath) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.deleted_artifacts.push(artifacts.clone());
        state
            .op_log
            .push(format!("delete-artifacts {}", artifacts.dex_path.display()));
        Ok(state.delete_artifacts_bytes)
    }

    async fn delete_runtime_artifacts(&self, runtime: &RuntimeArtifactsPath) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.deleted_runtime_artifacts.push(runtime.clone());
        state.op_log.push(format!(
            "delete-runtime-artifacts {}",
            runtime.dex_path.display()
        ));
        Ok(0)
    }

    async fn cleanup(
        &self,
        profiles_to_keep: &[PathBuf],
        artifacts_to_keep: &[ArtifactsPath],
        vdex_to_keep: &[VdexPath],
        runtime_artifacts_to_keep: &[RuntimeArtifactsPath],
    ) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.cleanup_calls.push((
            profiles_to_keep.len(),
            artifacts_to_keep.len(),
            vdex_to_keep.len(),
            runtime_artifacts_to_keep.len(),
        ));
        // The sweep only frees bytes once; a second pass finds nothing.
        let freed = state.cleanup_freed;
        state.cleanup_freed = 0;
        Ok(freed)
    }
}

pub struct FixedClock(pub AtomicI64);

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct FixedStorage(pub AtomicI64);

impl StorageManager for FixedStorage {
    fn allocatable_bytes(&self, _storage_uuid: &str) -> Result<i64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct RecordingScheduler {
    pub scheduled: Mutex<Vec<JobInfo>>,
    pub unscheduled: AtomicBool,
}

impl JobScheduler for RecordingScheduler {
    fn schedule(&self, job: JobInfo) -> Result<()> {
        self.scheduled.lock().unwrap().push(job);
        Ok(())
    }

    fn unschedule(&self) {
        self.unscheduled.store(true, Ordering::SeqCst);
    }
}

pub struct SetHibernation(pub HashSet<String>);

impl HibernationManager for SetHibernation {
    fn is_hibernating(&self, package_name: &str) -> bool {
        self.0.contains(package_name)
    }
}

pub struct SharedSnapshot(pub Arc<Snapshot>);

impl SnapshotProvider for SharedSnapshot {
    fn snapshot(&self) -> Result<Arc<Snapshot>> {
        Ok(self.0.clone())
    }
}

/// Everything a test needs to drive the engine.
pub struct Fixture {
    pub platform: Platform,
    pub daemon: Arc<MockDaemon>,
    pub snapshot: Arc<Snapshot>,
    pub clock: Arc<FixedClock>,
    pub storage: Arc<FixedStorage>,
    pub scheduler: Arc<RecordingScheduler>,
    pub tempdir: tempfile::TempDir,
}

pub struct FixtureBuilder {
    snapshot: Snapshot,
    props: MapProperties,
    users: Vec<u32>,
    hibernating: HashSet<String>,
    now_ms: i64,
    allocatable: i64,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        FixtureBuilder {
            snapshot: Snapshot::default(),
            props: MapProperties::default(),
            users: vec![0],
            hibernating: HashSet::new(),
            now_ms: 1_700_000_000_000,
            allocatable: 10_000_000_000,
        }
    }

    pub fn package(mut self, pkg: PackageState) -> Self {
        self.snapshot.packages.insert(pkg.name.clone(), pkg);
        self
    }

    pub fn library(mut self, lib: dexopt_core::package::SharedLibrary) -> Self {
        self.snapshot.libraries.insert(lib.name.clone(), lib);
        self
    }

    pub fn prop(mut self, key: &str, value: &str) -> Self {
        self.props.set(key, value);
        self
    }

    pub fn env(mut self, name: &str, value: &str) -> Self {
        self.props.set_env(name, value);
        self
    }

    pub fn users(mut self, users: Vec<u32>) -> Self {
        self.users = users;
        self
    }

    pub fn hibernating(mut self, package_name: &str) -> Self {
        self.hibernating.insert(package_name.to_string());
        self
    }

    pub fn now_ms(mut self, now_ms: i64) -> Self {
        self.now_ms = now_ms;
        self
    }

    pub fn allocatable(mut self, bytes: i64) -> Self {
        self.allocatable = bytes;
        self
    }

    pub fn build(self) -> Fixture {
        let tempdir = tempfile::TempDir::new().expect("tempdir");
        let daemon = MockDaemon::new();
        let snapshot = Arc::new(self.snapshot);
        let clock = Arc::new(FixedClock(AtomicI64::new(self.now_ms)));
        let storage = Arc::new(FixedStorage(AtomicI64::new(self.allocatable)));
        let scheduler = Arc::new(RecordingScheduler::default());

        let config = ServiceConfig {
            data_dir: PathBuf::from("/data"),
            persist_dir: tempdir.path().join("persist"),
            tmp_dir: tempdir.path().to_path_buf(),
            ..ServiceConfig::default()
        };

        let platform = Platform {
            daemon: daemon.clone(),
            snapshots: Arc::new(SharedSnapshot(snapshot.clone())),
            storage: storage.clone(),
            users: Arc::new(StaticUserManager(self.users)),
            power: Arc::new(NoopPowerManager),
            hibernation: if self.hibernating.is_empty() {
                None
            } else {
                Some(Arc::new(SetHibernation(self.hibernating)))
            },
            scheduler: scheduler.clone(),
            props: Arc::new(self.props),
            clock: clock.clone(),
            config,
        };

        Fixture {
            platform,
            daemon,
            snapshot,
            clock,
            storage,
            scheduler,
            tempdir,
        }
    }
}
