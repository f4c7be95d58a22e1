//! `dump`: human-readable state dump.

use anyhow::Result;
use dexopt_core::service::DexoptService;
use std::sync::Arc;

pub async fn run(service: &Arc<DexoptService>, pkg: Option<&str>) -> Result<()> {
    let text = service.dump(pkg).await?;
    print!("{text}");
    Ok(())
}
