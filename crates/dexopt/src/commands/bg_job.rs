//! `bg-dexopt-job`: control the periodic background run.

use anyhow::Result;
use dexopt_core::background::{PassProgressCallback, ScheduleStatus};
use dexopt_core::errors::DexoptError;
use dexopt_core::result::BatchPass;
use dexopt_core::service::DexoptService;
use std::sync::Arc;

pub async fn run(
    service: &Arc<DexoptService>,
    enable: bool,
    disable: bool,
    cancel: bool,
) -> Result<()> {
    if [enable, disable, cancel].iter().filter(|b| **b).count() > 1 {
        return Err(DexoptError::invalid_argument(
            "--enable, --disable and --cancel are mutually exclusive",
        )
        .into());
    }

    let job = service.background_job();
    if enable {
        match job.schedule(None)? {
            ScheduleStatus::Scheduled => println!("background dexopt scheduled"),
            ScheduleStatus::DisabledBySystemProperty => {
                println!("background dexopt disabled by system property")
            }
        }
        return Ok(());
    }
    if disable {
        job.unschedule();
        println!("background dexopt unscheduled");
        return Ok(());
    }
    if cancel {
        job.cancel();
        println!("background dexopt cancelled");
        return Ok(());
    }

    // No flag: run now and wait. Only main-pass progress is rendered; the
    // downgrade pass stays quiet.
    let progress: PassProgressCallback = Arc::new(|pass, current, total| {
        if pass == BatchPass::Main {
            eprintln!("bg-dexopt progress: {current}/{total}");
        }
    });
    job.set_progress_callback(Some(progress));
    let outcome = job.start().await;
    job.set_progress_callback(None);
    let outcome = outcome?;
    println!("background run: {:?}", outcome.status);
    if let Some(result) = &outcome.result {
        for (pass, batch) in &result.passes {
            println!("pass {:?}: reason={} mode={}", pass, batch.reason, batch.mode);
            for package_result in &batch.package_results {
                super::print_package_result(package_result);
            }
        }
    }
    if let Some(error) = &outcome.error {
        eprintln!("run error: {error}");
    }
    Ok(())
}
