//! Background dexopt job controller
//!
//! Owns the periodic background run: scheduling under device constraints,
//! one in-flight execution at a time, scheduler stop plumbing, a
//! storage-pressure downgrade pass ahead of the main pass, and metrics.

use crate::batch::{self, BatchCallbacks, ProgressCallback};
use crate::cancel::CancellationSignal;
use crate::cleanup;
use crate::dex_use::DexUseRegistry;
use crate::errors::{DexoptError, Result};
use crate::metrics::{
    BackgroundRunMetrics, BackgroundRunStatus, MetricsSink, TracingMetricsSink,
};
use crate::platform::{JobInfo, Platform};
use crate::reason::{REASON_BG_DEXOPT, REASON_INACTIVE};
use crate::result::{BackgroundRunResult, BatchPass};
use crate::types::DexoptParams;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// Default extra headroom above the platform's low-storage line that
/// triggers the inactive-package downgrade pass.
pub const DEFAULT_DOWNGRADE_HEADROOM_BYTES: i64 = 500_000_000;

const JOB_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of a `schedule` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Scheduled,
    DisabledBySystemProperty,
}

/// Hook that may adjust the job constraints before scheduling.
pub type ScheduleOverride = Box<dyn Fn(&mut JobInfo) + Send + Sync>;

/// Observer for background-run progress. Each pass reports separately with
/// `(pass, current, total)`, starting at `(pass, 0, total)`.
pub type PassProgressCallback = Arc<dyn Fn(BatchPass, i32, i32) + Send + Sync>;

/// What a finished run reports back to waiters.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: BackgroundRunStatus,
    pub result: Option<BackgroundRunResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelSource {
    Scheduler,
    Api,
}

struct RunHandle {
    cancel: CancellationSignal,
    done: watch::Receiver<Option<Arc<RunOutcome>>>,
}

enum JobState {
    Idle,
    Running(Arc<RunHandle>),
}

/// The background job controller. One per service.
pub struct BackgroundDexoptJob {
    platform: Platform,
    registry: Arc<DexUseRegistry>,
    callbacks: Arc<BatchCallbacks>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<JobState>,
    cancel_source: Mutex<Option<CancelSource>>,
    last_stop_reason: Mutex<Option<i32>>,
    progress: Mutex<Option<PassProgressCallback>>,
    /// Tunable storage headroom for the downgrade pass.
    pub downgrade_headroom_bytes: i64,
}

impl BackgroundDexoptJob {
    pub fn new(
        platform: Platform,
        registry: Arc<DexUseRegistry>,
        callbacks: Arc<BatchCallbacks>,
    ) -> Self {
        BackgroundDexoptJob {
            platform,
            registry,
            callbacks,
            metrics: Arc::new(TracingMetricsSink),
            state: Mutex::new(JobState::Idle),
            cancel_source: Mutex::new(None),
            last_stop_reason: Mutex::new(None),
            progress: Mutex::new(None),
            downgrade_headroom_bytes: DEFAULT_DOWNGRADE_HEADROOM_BYTES,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register a progress observer for subsequent runs. The downgrade and
    /// main passes report independently; pass `None` to detach.
    pub fn set_progress_callback(&self, callback: Option<PassProgressCallback>) {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = callback;
    }

    /// Register the periodic job with the scheduler. The override hook may
    /// tune constraints, but the storage constraint and retry policy belong
    /// to this controller.
    pub fn schedule(&self, override_hook: Option<&ScheduleOverride>) -> Result<ScheduleStatus> {
        if self
            .platform
            .props
            .get_bool("pm.dexopt.disable_bg_dexopt", false)
        {
            info!("Background dexopt disabled by system property");
            return Ok(ScheduleStatus::DisabledBySystemProperty);
        }
        let mut job = JobInfo {
            period: JOB_PERIOD,
            require_device_idle: true,
            require_charging: true,
            require_battery_not_low: true,
            require_storage_not_low: false,
            retry_policy: None,
        };
        if let Some(hook) = override_hook {
            hook(&mut job);
            if job.require_storage_not_low {
                return Err(DexoptError::invalid_argument(
                    "the storage constraint is owned by the background job's own storage logic",
                ));
            }
            if job.retry_policy.is_some() {
                return Err(DexoptError::invalid_argument(
                    "the retry policy cannot be overridden",
                ));
            }
            if job.period < JOB_PERIOD {
                warn!(period = ?job.period, "Clamping background job period to one day");
                job.period = JOB_PERIOD;
            }
        }
        self.platform.scheduler.schedule(job)?;
        Ok(ScheduleStatus::Scheduled)
    }

    pub fn unschedule(&self) {
        self.platform.scheduler.unschedule();
    }

    /// Scheduler entry point; fire and forget.
    pub fn on_job_started(self: &Arc<Self>) {
        self.spawn_run();
    }

    /// Scheduler stop: record the reason, cancel the run, ask for the
    /// default reschedule policy.
    pub fn on_job_stopped(&self, stop_reason: i32) -> crate::platform::RetryPolicy {
        *self
            .last_stop_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(stop_reason);
        self.cancel_with(CancelSource::Scheduler);
        crate::platform::RetryPolicy::Default
    }

    pub fn last_stop_reason(&self) -> Option<i32> {
        *self
            .last_stop_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Start a run now, or join the one already in flight, and wait for it.
    pub async fn start(self: &Arc<Self>) -> Result<Arc<RunOutcome>> {
        let handle = self.spawn_run();
        let mut done = handle.done.clone();
        let outcome = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DexoptError::internal("background run vanished"))?;
        Ok(outcome.clone().expect("checked by wait_for"))
    }

    /// Cancel the in-flight run, if any.
    pub fn cancel(&self) {
        self.cancel_with(CancelSource::Api);
    }

    pub fn is_running(&self) -> bool {
        matches!(
            &*self.state.lock().unwrap_or_else(|e| e.into_inner()),
            JobState::Running(_)
        )
    }

    fn cancel_with(&self, source: CancelSource) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let JobState::Running(handle) = &*state {
            let mut recorded = self
                .cancel_source
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            recorded.get_or_insert(source);
            handle.cancel.cancel();
        }
    }

    fn spawn_run(self: &Arc<Self>) -> Arc<RunHandle> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let JobState::Running(handle) = &*state {
            return handle.clone();
        }

        let cancel = CancellationSignal::new();
        let (tx, rx) = watch::channel(None);
        let handle = Arc::new(RunHandle {
            cancel: cancel.clone(),
            done: rx,
        });
        *state = JobState::Running(handle.clone());
        *self
            .cancel_source
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = Arc::new(this.execute(cancel).await);
            *this.state.lock().unwrap_or_else(|e| e.into_inner()) = JobState::Idle;
            let _ = tx.send(Some(outcome));
        });
        handle
    }

    #[instrument(skip_all)]
    async fn execute(&self, cancel: CancellationSignal) -> RunOutcome {
        let started = Instant::now();
        let outcome = self.execute_inner(&cancel).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(result) => {
                let status = if cancel.is_cancelled() {
                    match *self
                        .cancel_source
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                    {
                        Some(CancelSource::Api) => BackgroundRunStatus::AbortByApi,
                        _ => BackgroundRunStatus::AbortByCancellation,
                    }
                } else {
                    BackgroundRunStatus::JobFinished
                };
                self.metrics.report_background_run(&BackgroundRunMetrics::from_result(
                    status,
                    duration_ms,
                    &result,
                ));
                RunOutcome {
                    status,
                    result: Some(result),
                    error: None,
                }
            }
            Err(e) => {
                let status = if is_out_of_space(&e) {
                    BackgroundRunStatus::AbortNoSpaceLeft
                } else {
                    BackgroundRunStatus::FatalError
                };
                error!(error = %e, "Background dexopt run failed");
                self.metrics.report_background_run(&BackgroundRunMetrics {
                    status,
                    duration_ms,
                    packages_dexopted: 0,
                    packages_depending_on_boot_image: 0,
                });
                RunOutcome {
                    status,
                    result: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Per-pass view of the registered progress observer.
    fn pass_progress(&self, pass: BatchPass) -> Option<ProgressCallback> {
        let observer = self
            .progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()?;
        Some(Arc::new(move |current, total| {
            observer(pass, current, total)
        }))
    }

    async fn execute_inner(&self, cancel: &CancellationSignal) -> Result<BackgroundRunResult> {
        let snapshot = self.platform.snapshots.snapshot()?;
        let mut run = BackgroundRunResult::default();

        // Main-pass inputs, with the registered override applied.
        let mut main_packages = batch::default_package_list(
            &self.platform,
            &self.registry,
            &snapshot,
            REASON_BG_DEXOPT,
        );
        let mut main_params = DexoptParams::for_reason(REASON_BG_DEXOPT)?;
        {
            let hook = self
                .callbacks
                .batch_start
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(hook) = hook.as_ref() {
                if let Some(adjust) = hook(REASON_BG_DEXOPT, &main_packages, &main_params) {
                    if let Some(packages) = adjust.packages {
                        main_packages = packages;
                    }
                    if let Some(params) = adjust.params {
                        if params.reason != REASON_BG_DEXOPT {
                            return Err(DexoptError::invalid_argument(
                                "a batch-start callback cannot change the reason",
                            ));
                        }
                        main_params = params;
                    }
                }
            }
        }

        // Downgrade pass: only under storage pressure, only packages the
        // main pass will not touch anyway.
        let allocatable = self.platform.storage.allocatable_bytes("")?;
        if allocatable < self.downgrade_headroom_bytes {
            let main_set: HashSet<&String> = main_packages.iter().collect();
            let downgrade_packages: Vec<String> = batch::default_package_list(
                &self.platform,
                &self.registry,
                &snapshot,
                REASON_INACTIVE,
            )
            .into_iter()
            .filter(|name| !main_set.contains(name))
            .collect();
            if !downgrade_packages.is_empty() {
                info!(
                    allocatable,
                    packages = downgrade_packages.len(),
                    "Storage pressure, downgrading inactive packages"
                );
                let mut params = DexoptParams::for_reason(REASON_INACTIVE)?;
                if let Some(mode) = self.platform.props.get("pm.dexopt.inactive") {
                    match crate::reason::CompilerMode::from_name(&mode) {
                        Ok(mode) => params.mode = mode,
                        Err(_) => warn!(value = %mode, "Ignoring bad inactive mode override"),
                    }
                }
                let result = batch::dexopt_packages(
                    &self.platform,
                    &self.registry,
                    &snapshot,
                    downgrade_packages,
                    &params,
                    cancel,
                    self.pass_progress(BatchPass::Downgrade),
                    &[],
                )
                .await?;
                run.passes.insert(BatchPass::Downgrade, result);
            }
        }

        let main_result = batch::dexopt_packages(
            &self.platform,
            &self.registry,
            &snapshot,
            main_packages,
            &main_params,
            cancel,
            self.pass_progress(BatchPass::Main),
            &self.callbacks.done_callbacks(),
        )
        .await?;
        run.passes.insert(BatchPass::Main, main_result);

        if !cancel.is_cancelled() {
            let freed = cleanup::cleanup(&self.platform, &self.registry, &snapshot).await?;
            info!(freed_bytes = freed, "Post-run cleanup finished");
        }

        Ok(run)
    }
}

fn is_out_of_space(error: &DexoptError) -> bool {
    match error {
        DexoptError::Io { source } => source.raw_os_error() == Some(28),
        other => other.to_string().contains("No space left"),
    }
}
