//! `dexopt-package`: dexopt or reset a single package.

use anyhow::Result;
use dexopt_core::cancel::CancellationSignal;
use dexopt_core::errors::DexoptError;
use dexopt_core::reason::{self, CompilerMode, PriorityClass};
use dexopt_core::service::DexoptService;
use dexopt_core::types::{DexoptFlags, DexoptParams};
use std::sync::Arc;

#[derive(Debug)]
pub struct PackageArgs {
    pub pkg: String,
    pub mode: Option<String>,
    pub priority: Option<i32>,
    pub reason: String,
    pub force: bool,
    pub secondary_dex: bool,
    pub split: Option<String>,
    pub reset: bool,
    pub json: bool,
}

pub async fn run(service: &Arc<DexoptService>, args: PackageArgs) -> Result<()> {
    let cancel = CancellationSignal::new();

    let result = if args.reset {
        service.reset_dexopt_status(&args.pkg, &cancel).await?
    } else {
        let params = build_params(&args)?;
        service.dexopt_package(&args.pkg, &params, &cancel).await?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        super::print_package_result(&result);
    }
    Ok(())
}

fn build_params(args: &PackageArgs) -> Result<DexoptParams> {
    let mut params = match DexoptParams::for_reason(&args.reason) {
        Ok(params) => params,
        Err(_) => {
            // A custom reason is fine, but then the caller owes us the mode
            // and priority the table cannot supply.
            let (Some(mode), Some(priority)) = (&args.mode, args.priority) else {
                return Err(DexoptError::invalid_argument(format!(
                    "custom reason \"{}\" requires -m and -p",
                    args.reason
                ))
                .into());
            };
            DexoptParams::for_custom_reason(
                &args.reason,
                CompilerMode::from_name(mode)?,
                PriorityClass(priority),
                DexoptFlags::FOR_PRIMARY_DEX,
            )?
        }
    };

    if let Some(mode) = &args.mode {
        params = params.with_mode(CompilerMode::from_name(mode)?);
    }
    if let Some(priority) = args.priority {
        let priority = PriorityClass(priority);
        priority.validate()?;
        params = params.with_priority(priority);
    }
    if args.force {
        params.flags |= DexoptFlags::FORCE;
    }
    if args.secondary_dex {
        params.flags |= DexoptFlags::FOR_SECONDARY_DEX;
    }
    params = params.with_split(args.split.clone());
    params.validate()?;

    // Helpful hint: batch reasons are not package reasons.
    if reason::is_batch_reason(&params.reason) {
        tracing::debug!(reason = %params.reason, "Batch reason used for a single package");
    }
    Ok(params)
}
