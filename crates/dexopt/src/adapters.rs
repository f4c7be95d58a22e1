//! Local platform adapters
//!
//! Wires the core's collaborator traits to what a development host can
//! provide: a JSON snapshot file, a subprocess daemon helper, a sysinfo
//! storage probe, and property overrides from the command line.

use crate::cli::PlatformArgs;
use anyhow::{Context, Result};
use dexopt_core::background::BackgroundDexoptJob;
use dexopt_core::daemon::SubprocessDaemon;
use dexopt_core::errors::{DexoptError, Result as CoreResult};
use dexopt_core::package::{FixedSnapshot, Snapshot};
use dexopt_core::platform::{
    JobInfo, JobScheduler, MapProperties, NoopPowerManager, Platform, ServiceConfig,
    StaticUserManager, StorageManager, SystemClock,
};
use dexopt_core::service::DexoptService;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use sysinfo::Disks;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default helper binary name when `--daemon` is not given; resolved via
/// PATH.
const DEFAULT_DAEMON: &str = "dexopt-daemon-helper";

/// Storage probe over the host's disks, with a command-line override.
pub struct HostStorage {
    data_dir: PathBuf,
    override_bytes: Option<i64>,
}

impl StorageManager for HostStorage {
    fn allocatable_bytes(&self, _storage_uuid: &str) -> CoreResult<i64> {
        if let Some(bytes) = self.override_bytes {
            return Ok(bytes);
        }
        let disks = Disks::new_with_refreshed_list();
        let available = disks
            .iter()
            .filter(|disk| self.data_dir.starts_with(disk.mount_point()))
            .map(|disk| disk.available_space() as i64)
            .max()
            .unwrap_or(0);
        debug!(available, "Storage probe");
        Ok(available)
    }
}

/// In-process periodic scheduler: a plain tokio interval standing in for
/// the platform's job scheduler. Device-state constraints (idle, charging,
/// battery) are accepted but not enforced on a development host.
#[derive(Default)]
pub struct TokioIntervalScheduler {
    job: Mutex<Option<Arc<BackgroundDexoptJob>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokioIntervalScheduler {
    /// Attach the job the timer fires; done after the service is built.
    pub fn bind(&self, job: Arc<BackgroundDexoptJob>) {
        *self.job.lock().unwrap_or_else(|e| e.into_inner()) = Some(job);
    }
}

impl JobScheduler for TokioIntervalScheduler {
    fn schedule(&self, info: JobInfo) -> CoreResult<()> {
        let job = self
            .job
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| DexoptError::internal("scheduler has no job bound"))?;
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = task.take() {
            previous.abort();
        }
        debug!(period = ?info.period, "Scheduling periodic background dexopt");
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(info.period);
            // The first tick fires immediately; the job is periodic, not
            // run-on-schedule.
            interval.tick().await;
            loop {
                interval.tick().await;
                job.on_job_started();
            }
        }));
        Ok(())
    }

    fn unschedule(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = task.take() {
            previous.abort();
        }
    }
}

pub fn build_service(args: &PlatformArgs) -> Result<Arc<DexoptService>> {
    let snapshot = match &args.snapshot {
        Some(path) => Snapshot::load_from_file(path)
            .with_context(|| format!("loading snapshot {path:?}"))?,
        None => Snapshot::default(),
    };

    let mut props = MapProperties::default();
    for entry in &args.props {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("bad --prop \"{entry}\", expected KEY=VALUE"))?;
        props.set(key, value);
    }

    let users = match &args.users {
        Some(list) => StaticUserManager(
            list.split(',')
                .map(|id| id.trim().parse::<u32>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .with_context(|| format!("bad --users \"{list}\""))?,
        ),
        None => StaticUserManager::default(),
    };

    let mut config = ServiceConfig::default();
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
        config.persist_dir = data_dir.join("system");
    }

    let daemon_program = args
        .daemon
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DAEMON));

    let scheduler = Arc::new(TokioIntervalScheduler::default());
    let platform = Platform {
        daemon: Arc::new(SubprocessDaemon::new(daemon_program)),
        snapshots: Arc::new(FixedSnapshot::new(snapshot)),
        storage: Arc::new(HostStorage {
            data_dir: config.data_dir.clone(),
            override_bytes: args.allocatable_bytes,
        }),
        users: Arc::new(users),
        power: Arc::new(NoopPowerManager),
        hibernation: None,
        scheduler: scheduler.clone(),
        props: Arc::new(props),
        clock: Arc::new(SystemClock),
        config,
    };

    let service = DexoptService::new(platform);
    scheduler.bind(service.background_job().clone());
    service.load_state()?;
    Ok(service)
}
