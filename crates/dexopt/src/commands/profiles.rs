//! Profile commands: clear, dump, snapshot.

use anyhow::{Context, Result};
use bytesize::ByteSize;
use dexopt_core::service::DexoptService;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

pub async fn clear(
    service: &Arc<DexoptService>,
    pkg: &str,
    also_delete_artifacts: bool,
) -> Result<()> {
    if also_delete_artifacts {
        let freed = service.delete_dexopt_artifacts(pkg).await?;
        println!("deleted artifacts of {pkg}, freed {}", ByteSize(freed.max(0) as u64));
    }
    service.clear_app_profiles(pkg).await?;
    println!("cleared profiles of {pkg}");
    Ok(())
}

pub async fn dump(
    service: &Arc<DexoptService>,
    pkg: &str,
    dump_classes_and_methods: bool,
) -> Result<()> {
    let mut handle = service
        .dump_app_profile(pkg, None, dump_classes_and_methods)
        .await?;
    let mut text = String::new();
    handle
        .read_to_string(&mut text)
        .context("reading profile dump")?;
    print!("{text}");
    Ok(())
}

pub async fn snapshot_app(
    service: &Arc<DexoptService>,
    pkg: &str,
    split: Option<&str>,
    output: Option<PathBuf>,
) -> Result<()> {
    let handle = service.snapshot_app_profile(pkg, split).await?;
    let output = output.unwrap_or_else(|| PathBuf::from(format!("{pkg}.prof")));
    write_snapshot(handle, &output)
}

pub async fn snapshot_boot_image(
    service: &Arc<DexoptService>,
    output: Option<PathBuf>,
) -> Result<()> {
    let handle = service.snapshot_boot_image_profile().await?;
    let output = output.unwrap_or_else(|| PathBuf::from("boot-image.prof"));
    write_snapshot(handle, &output)
}

fn write_snapshot(mut handle: File, output: &PathBuf) -> Result<()> {
    let mut file =
        File::create(output).with_context(|| format!("creating snapshot output {output:?}"))?;
    let bytes = io::copy(&mut handle, &mut file).context("writing snapshot")?;
    println!("wrote {} to {}", ByteSize(bytes), output.display());
    Ok(())
}
