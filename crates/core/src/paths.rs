//! Filesystem layout
//!
//! Pure path derivation for profiles and per-app data directories. The
//! daemon owns the files themselves; these helpers only agree with it on
//! where things live.

use crate::platform::ServiceConfig;
use std::path::{Path, PathBuf};

/// Profile slot name for a primary container.
pub fn profile_name_for_split(split_name: Option<&str>) -> String {
    match split_name {
        None => "primary".to_string(),
        Some(name) => format!("{name}.split"),
    }
}

/// Aggregated reference profile of a primary container.
pub fn primary_ref_profile_path(
    config: &ServiceConfig,
    package_name: &str,
    split_name: Option<&str>,
) -> PathBuf {
    config
        .data_dir
        .join("misc/profiles/ref")
        .join(package_name)
        .join(format!("{}.prof", profile_name_for_split(split_name)))
}

/// Live per-user profile of a primary container.
pub fn primary_cur_profile_path(
    config: &ServiceConfig,
    user_id: u32,
    package_name: &str,
    split_name: Option<&str>,
) -> PathBuf {
    config
        .data_dir
        .join("misc/profiles/cur")
        .join(user_id.to_string())
        .join(package_name)
        .join(format!("{}.prof", profile_name_for_split(split_name)))
}

/// Reference profile of a secondary container, kept in the `oat` directory
/// next to the container.
pub fn secondary_ref_profile_path(dex_path: &Path) -> PathBuf {
    let file = dex_path.file_name().unwrap_or_default();
    let mut name = file.to_os_string();
    name.push(".prof");
    dex_path
        .parent()
        .unwrap_or_else(|| Path::new("/"))
        .join("oat")
        .join(name)
}

/// Live profile of a secondary container, next to the container itself.
pub fn secondary_cur_profile_path(dex_path: &Path) -> PathBuf {
    append_suffix(dex_path, ".cur.prof")
}

/// Install-time profile shipped next to a primary container.
pub fn prebuilt_profile_path(dex_path: &Path) -> PathBuf {
    append_suffix(dex_path, ".prof")
}

/// Sidecar DM archive of a container.
pub fn dm_path(dex_path: &Path) -> PathBuf {
    dex_path.with_extension("dm")
}

/// A fresh temporary slot next to `final_path`. The daemon's
/// `commit_tmp_profile` strips the `.<id>.tmp` suffix to find the final
/// slot, so the shape here is part of the contract.
pub fn tmp_profile_path(final_path: &Path) -> PathBuf {
    append_suffix(final_path, &format!(".{:08x}.tmp", fastrand::u32(..)))
}

/// Containers on read-only partitions keep artifacts in the shared
/// dalvik-cache directory instead of an `oat` directory next to the dex.
pub fn is_in_dalvik_cache(config: &ServiceConfig, dex_path: &Path) -> bool {
    config
        .system_partitions
        .iter()
        .any(|p| dex_path.starts_with(p))
}

/// Credential-encrypted data directory of (package, user) on a volume.
/// An empty `storage_uuid` is the internal volume.
pub fn ce_data_dir(
    config: &ServiceConfig,
    storage_uuid: &str,
    user_id: u32,
    package_name: &str,
) -> PathBuf {
    volume_root(config, storage_uuid)
        .join("user")
        .join(user_id.to_string())
        .join(package_name)
}

/// Device-encrypted data directory of (package, user) on a volume.
pub fn de_data_dir(
    config: &ServiceConfig,
    storage_uuid: &str,
    user_id: u32,
    package_name: &str,
) -> PathBuf {
    volume_root(config, storage_uuid)
        .join("user_de")
        .join(user_id.to_string())
        .join(package_name)
}

fn volume_root(config: &ServiceConfig, storage_uuid: &str) -> PathBuf {
    if storage_uuid.is_empty() {
        config.data_dir.clone()
    } else {
        config.data_dir.join("expand").join(storage_uuid)
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServiceConfig {
        ServiceConfig::default()
    }

    #[test]
    fn test_primary_profile_paths() {
        let config = config();
        assert_eq!(
            primary_ref_profile_path(&config, "com.example", None),
            PathBuf::from("/data/misc/profiles/ref/com.example/primary.prof")
        );
        assert_eq!(
            primary_cur_profile_path(&config, 10, "com.example", Some("feature1")),
            PathBuf::from("/data/misc/profiles/cur/10/com.example/feature1.split.prof")
        );
    }

    #[test]
    fn test_secondary_profile_paths() {
        let dex = Path::new("/data/user/0/com.example/files/plugin.jar");
        assert_eq!(
            secondary_ref_profile_path(dex),
            PathBuf::from("/data/user/0/com.example/files/oat/plugin.jar.prof")
        );
        assert_eq!(
            secondary_cur_profile_path(dex),
            PathBuf::from("/data/user/0/com.example/files/plugin.jar.cur.prof")
        );
    }

    #[test]
    fn test_dm_and_prebuilt_paths() {
        let dex = Path::new("/data/app/com.example/base.apk");
        assert_eq!(dm_path(dex), PathBuf::from("/data/app/com.example/base.dm"));
        assert_eq!(
            prebuilt_profile_path(dex),
            PathBuf::from("/data/app/com.example/base.apk.prof")
        );
    }

    #[test]
    fn test_tmp_profile_path_shape() {
        let tmp = tmp_profile_path(Path::new("/data/misc/profiles/ref/a/primary.prof"));
        let s = tmp.to_string_lossy();
        assert!(s.starts_with("/data/misc/profiles/ref/a/primary.prof."));
        assert!(s.ends_with(".tmp"));
    }

    #[test]
    fn test_dalvik_cache_decision() {
        let config = config();
        assert!(is_in_dalvik_cache(
            &config,
            Path::new("/system/framework/services.jar")
        ));
        assert!(!is_in_dalvik_cache(
            &config,
            Path::new("/data/app/com.example/base.apk")
        ));
    }

    #[test]
    fn test_data_dirs() {
        let config = config();
        assert_eq!(
            ce_data_dir(&config, "", 0, "com.example"),
            PathBuf::from("/data/user/0/com.example")
        );
        assert_eq!(
            de_data_dir(&config, "ab12", 10, "com.example"),
            PathBuf::from("/data/expand/ab12/user_de/10/com.example")
        );
    }
}
