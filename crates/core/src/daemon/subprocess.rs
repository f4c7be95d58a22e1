//! Subprocess-backed compiler daemon client
//!
//! Talks to a helper binary: one operation per invocation, a JSON request on
//! stdin, a JSON reply on stdout. A non-zero exit is a service-specific
//! failure for that input; spawn or protocol problems are transport errors.

use super::{
    ArtifactsPath, CompilerDaemon, DaemonCancellation, DaemonDexoptResult, DexoptCall,
    DexoptNeededResult, DexoptStatusInfo, DexoptTrigger, FileVisibility, MergeProfileOptions,
    RuntimeArtifactsPath, VdexPath,
};
use crate::errors::{DexoptError, Result};
use crate::reason::CompilerMode;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Compiler daemon reached through a helper binary.
#[derive(Debug, Clone)]
pub struct SubprocessDaemon {
    program: PathBuf,
}

#[derive(Deserialize)]
struct BoolReply {
    value: bool,
}

#[derive(Deserialize)]
struct BytesReply {
    freed_bytes: i64,
}

#[derive(Deserialize)]
struct VisibilityReply {
    visibility: FileVisibility,
}

impl SubprocessDaemon {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        SubprocessDaemon {
            program: program.into(),
        }
    }

    async fn call<T: DeserializeOwned>(&self, op: &str, request: serde_json::Value) -> Result<T> {
        debug!(op = %op, "Calling compiler daemon");
        let mut child = Command::new(&self.program)
            .arg(op)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DexoptError::DaemonTransport {
                message: format!("failed to spawn {:?}: {e}", self.program),
            })?;

        let payload = serde_json::to_vec(&request).map_err(|e| DexoptError::DaemonTransport {
            message: format!("failed to encode {op} request: {e}"),
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            // A helper that fails fast may close stdin before reading it;
            // the exit status carries the real verdict.
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(op = %op, error = %e, "Daemon closed stdin early");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DexoptError::DaemonTransport {
                message: format!("failed to wait for {op}: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DexoptError::DaemonService {
                operation: op.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| DexoptError::DaemonTransport {
            message: format!("malformed {op} reply: {e}"),
        })
    }
}

/// Cancellation handle correlated with the helper by token.
struct SubprocessCancellation {
    program: PathBuf,
    token: String,
}

impl DaemonCancellation for SubprocessCancellation {
    fn cancel(&self) {
        // Fire and forget; the helper treats an unknown token as a no-op.
        let spawned = std::process::Command::new(&self.program)
            .arg("cancel")
            .arg("--token")
            .arg(&self.token)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            warn!(token = %self.token, error = %e, "Failed to deliver daemon cancel");
        }
    }

    fn token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}

#[async_trait]
impl CompilerDaemon for SubprocessDaemon {
    async fn create_cancellation_signal(&self) -> Result<Arc<dyn DaemonCancellation>> {
        Ok(Arc::new(SubprocessCancellation {
            program: self.program.clone(),
            token: format!("{:016x}", fastrand::u64(..)),
        }))
    }

    async fn get_dexopt_status(
        &self,
        dex_path: &Path,
        isa: &str,
        class_loader_context: &str,
    ) -> Result<DexoptStatusInfo> {
        self.call(
            "get-dexopt-status",
            json!({
                "dex_path": dex_path,
                "isa": isa,
                "class_loader_context": class_loader_context,
            }),
        )
        .await
    }

    async fn get_dexopt_needed(
        &self,
        dex_path: &Path,
        isa: &str,
        class_loader_context: &str,
        mode: CompilerMode,
        trigger: DexoptTrigger,
    ) -> Result<DexoptNeededResult> {
        self.call(
            "get-dexopt-needed",
            json!({
                "dex_path": dex_path,
                "isa": isa,
                "class_loader_context": class_loader_context,
                "compiler_filter": mode.name(),
                "trigger": trigger.0,
            }),
        )
        .await
    }

    async fn dexopt(
        &self,
        call: &DexoptCall,
        cancel: &Arc<dyn DaemonCancellation>,
    ) -> Result<DaemonDexoptResult> {
        let mut request = serde_json::to_value(call).map_err(|e| DexoptError::DaemonTransport {
            message: format!("failed to encode dexopt call: {e}"),
        })?;
        if let (Some(token), Some(map)) = (cancel.token(), request.as_object_mut()) {
            map.insert("cancellation_token".to_string(), json!(token));
        }
        self.call("dexopt", request).await
    }

    async fn get_profile_visibility(&self, path: &Path) -> Result<FileVisibility> {
        let reply: VisibilityReply = self
            .call("get-profile-visibility", json!({ "path": path }))
            .await?;
        Ok(reply.visibility)
    }

    async fn get_dex_file_visibility(&self, path: &Path) -> Result<FileVisibility> {
        let reply: VisibilityReply = self
            .call("get-dex-file-visibility", json!({ "path": path }))
            .await?;
        Ok(reply.visibility)
    }

    async fn get_dm_file_visibility(&self, path: &Path) -> Result<FileVisibility> {
        let reply: VisibilityReply = self
            .call("get-dm-file-visibility", json!({ "path": path }))
            .await?;
        Ok(reply.visibility)
    }

    async fn get_artifacts_visibility(&self, artifacts: &ArtifactsPath) -> Result<FileVisibility> {
        let reply: VisibilityReply = self
            .call("get-artifacts-visibility", json!({ "artifacts": artifacts }))
            .await?;
        Ok(reply.visibility)
    }

    async fn copy_and_rewrite_profile(
        &self,
        src: &Path,
        dst: &Path,
        dex_path: &Path,
    ) -> Result<bool> {
        let reply: BoolReply = self
            .call(
                "copy-and-rewrite-profile",
                json!({ "src": src, "dst": dst, "dex_path": dex_path }),
            )
            .await?;
        Ok(reply.value)
    }

    async fn is_profile_usable(&self, profile: &Path, dex_path: &Path) -> Result<bool> {
        let reply: BoolReply = self
            .call(
                "is-profile-usable",
                json!({ "profile": profile, "dex_path": dex_path }),
            )
            .await?;
        Ok(reply.value)
    }

    async fn merge_profiles(
        &self,
        cur_profiles: &[PathBuf],
        reference: Option<&Path>,
        output: &Path,
        dex_paths: &[PathBuf],
        options: &MergeProfileOptions,
    ) -> Result<bool> {
        let reply: BoolReply = self
            .call(
                "merge-profiles",
                json!({
                    "cur_profiles": cur_profiles,
                    "reference": reference,
                    "output": output,
                    "dex_paths": dex_paths,
                    "options": options,
                }),
            )
            .await?;
        Ok(reply.value)
    }

    async fn commit_tmp_profile(&self, tmp_profile: &Path) -> Result<()> {
        let _: serde_json::Value = self
            .call("commit-tmp-profile", json!({ "tmp_profile": tmp_profile }))
            .await?;
        Ok(())
    }

    async fn delete_profile(&self, path: &Path) -> Result<()> {
        let _: serde_json::Value = self.call("delete-profile", json!({ "path": path })).await?;
        Ok(())
    }

    async fn delete_artifacts(&self, artifacts: &ArtifactsPath) -> Result<i64> {
        let reply: BytesReply = self
            .call("delete-artifacts", json!({ "artifacts": artifacts }))
            .await?;
        Ok(reply.freed_bytes)
    }

    async fn delete_runtime_artifacts(&self, runtime: &RuntimeArtifactsPath) -> Result<i64> {
        let reply: BytesReply = self
            .call("delete-runtime-artifacts", json!({ "runtime": runtime }))
            .await?;
        Ok(reply.freed_bytes)
    }

    async fn cleanup(
        &self,
        profiles_to_keep: &[PathBuf],
        artifacts_to_keep: &[ArtifactsPath],
        vdex_to_keep: &[VdexPath],
        runtime_artifacts_to_keep: &[RuntimeArtifactsPath],
    ) -> Result<i64> {
        let reply: BytesReply = self
            .call(
                "cleanup",
                json!({
                    "profiles_to_keep": profiles_to_keep,
                    "artifacts_to_keep": artifacts_to_keep,
                    "vdex_to_keep": vdex_to_keep,
                    "runtime_artifacts_to_keep": runtime_artifacts_to_keep,
                }),
            )
            .await?;
        Ok(reply.freed_bytes)
    }
}
