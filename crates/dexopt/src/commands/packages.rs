//! `dexopt-packages`: batch dexopt with the reason's default selection.

use anyhow::Result;
use dexopt_core::cancel::CancellationSignal;
use dexopt_core::errors::DexoptError;
use dexopt_core::reason;
use dexopt_core::service::DexoptService;
use std::sync::Arc;

pub async fn run(service: &Arc<DexoptService>, batch_reason: &str, json: bool) -> Result<()> {
    if !reason::is_batch_reason(batch_reason) {
        return Err(DexoptError::invalid_argument(format!(
            "\"{batch_reason}\" is not a batch reason"
        ))
        .into());
    }

    let cancel = CancellationSignal::new();
    let progress: dexopt_core::batch::ProgressCallback = Arc::new(|current, total| {
        eprintln!("dexopt progress: {current}/{total}");
    });

    let result = service
        .dexopt_packages(batch_reason, None, None, &cancel, Some(progress))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    println!("batch reason={} mode={}", result.reason, result.mode);
    for package_result in &result.package_results {
        super::print_package_result(package_result);
    }
    Ok(())
}
