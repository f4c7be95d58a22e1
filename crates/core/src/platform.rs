//! Platform collaborator seam
//!
//! Everything the engine needs from the host platform is reached through the
//! trait objects bundled in [`Platform`]: storage, users, power, hibernation,
//! the job scheduler, system properties, and a clock. Production wires real
//! adapters; tests substitute per-trait mocks.

use crate::daemon::CompilerDaemon;
use crate::errors::Result;
use crate::package::SnapshotProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Read-only access to system properties.
///
/// `env` rides along for the few classpath environment variables the
/// boot-image profile snapshot needs; tests override both.
pub trait SystemProperties: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref() {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            _ => default,
        }
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    fn env(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// In-memory properties, used by tests and the CLI's property overrides.
#[derive(Debug, Default, Clone)]
pub struct MapProperties {
    pub props: HashMap<String, String>,
    pub envs: HashMap<String, String>,
}

impl MapProperties {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        MapProperties {
            props: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            envs: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.props.insert(key.to_string(), value.to_string());
    }

    pub fn set_env(&mut self, name: &str, value: &str) {
        self.envs.insert(name.to_string(), value.to_string());
    }
}

impl SystemProperties for MapProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.props.get(key).cloned()
    }

    fn env(&self, name: &str) -> Option<String> {
        self.envs.get(name).cloned()
    }
}

/// Wall-clock source, injectable for deterministic tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Storage state queries, per volume.
pub trait StorageManager: Send + Sync {
    /// Bytes that could still be allocated on the volume without pushing it
    /// below the platform's low-storage line. Non-positive means the volume
    /// is already under pressure.
    fn allocatable_bytes(&self, storage_uuid: &str) -> Result<i64>;
}

/// User accounts on the device.
pub trait UserManager: Send + Sync {
    fn user_ids(&self) -> Vec<u32>;

    /// Whether a uid belongs to an isolated sandbox process. Extension
    /// point; the default trusts the per-record isolation bit only.
    fn is_isolated_uid(&self, _uid: i32) -> bool {
        false
    }
}

/// Fixed user list.
#[derive(Debug, Clone)]
pub struct StaticUserManager(pub Vec<u32>);

impl Default for StaticUserManager {
    fn default() -> Self {
        StaticUserManager(vec![0])
    }
}

impl UserManager for StaticUserManager {
    fn user_ids(&self) -> Vec<u32> {
        self.0.clone()
    }
}

/// A held wakelock; released when dropped.
pub struct Wakelock {
    _token: Box<dyn std::any::Any + Send>,
}

impl Wakelock {
    pub fn new(token: Box<dyn std::any::Any + Send>) -> Self {
        Wakelock { _token: token }
    }
}

/// Partial-wakelock service.
pub trait PowerManager: Send + Sync {
    /// Acquire a partial wakelock. `timeout` is a last-resort fuse; the
    /// returned guard is the normal release path.
    fn acquire_wakelock(&self, tag: &str, timeout: Duration) -> Wakelock;
}

/// Power manager that holds nothing.
#[derive(Debug, Default)]
pub struct NoopPowerManager;

impl PowerManager for NoopPowerManager {
    fn acquire_wakelock(&self, _tag: &str, _timeout: Duration) -> Wakelock {
        Wakelock::new(Box::new(()))
    }
}

/// App hibernation queries. Optional; absence means no package is treated
/// as hibernating.
pub trait HibernationManager: Send + Sync {
    fn is_hibernating(&self, package_name: &str) -> bool;
}

/// Retry policy a scheduled job may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Let the scheduler apply its default backoff.
    Default,
    Backoff {
        initial_ms: i64,
        exponential: bool,
    },
}

/// Periodic job description handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub period: Duration,
    pub require_device_idle: bool,
    pub require_charging: bool,
    pub require_battery_not_low: bool,
    pub require_storage_not_low: bool,
    pub retry_policy: Option<RetryPolicy>,
}

/// Periodic-job scheduler.
pub trait JobScheduler: Send + Sync {
    fn schedule(&self, job: JobInfo) -> Result<()>;
    fn unschedule(&self);
}

/// Static service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Root of the writable data tree (profiles, per-user app data).
    pub data_dir: PathBuf,
    /// Directory for the persistent dex-use file.
    pub persist_dir: PathBuf,
    /// Directory for short-lived snapshot outputs.
    pub tmp_dir: PathBuf,
    /// The platform package; it never notifies dex loads and its profiles
    /// feed the boot-image snapshot.
    pub platform_package: String,
    pub system_ui_package: String,
    pub launcher_package: Option<String>,
    /// Read-only partitions whose containers keep artifacts in the shared
    /// dalvik-cache directory.
    pub system_partitions: Vec<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let persist_dir = directories_next::ProjectDirs::from("", "", "dexopt")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/data/system"));
        ServiceConfig {
            data_dir: PathBuf::from("/data"),
            persist_dir,
            tmp_dir: std::env::temp_dir(),
            platform_package: "android".to_string(),
            system_ui_package: "com.android.systemui".to_string(),
            launcher_package: None,
            system_partitions: ["/system", "/system_ext", "/product", "/vendor", "/odm"]
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

/// The bundle of collaborators shared by every component.
#[derive(Clone)]
pub struct Platform {
    pub daemon: Arc<dyn CompilerDaemon>,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub storage: Arc<dyn StorageManager>,
    pub users: Arc<dyn UserManager>,
    pub power: Arc<dyn PowerManager>,
    pub hibernation: Option<Arc<dyn HibernationManager>>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub props: Arc<dyn SystemProperties>,
    pub clock: Arc<dyn Clock>,
    pub config: ServiceConfig,
}

impl Platform {
    pub fn is_hibernating(&self, package_name: &str) -> bool {
        self.hibernation
            .as_ref()
            .map(|h| h.is_hibernating(package_name))
            .unwrap_or(false)
    }
}
