//! [`Host`] implementation for the machine we are running on

use super::{Host, MetadataClient, wildcard_match};
use crate::bootstrap::BootstrapParams;
use crate::InfraError;
use async_trait::async_trait;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Host backed by the local filesystem, system commands and IMDS
pub struct SystemHost {
    metadata: MetadataClient,
}

impl SystemHost {
    /// Host that queries the same metadata endpoint as the rendered script
    pub fn for_params(params: &BootstrapParams) -> Result<Self, InfraError> {
        Ok(Self {
            metadata: MetadataClient::with_base_url(params.metadata_endpoint.as_str())?,
        })
    }

    pub fn with_metadata(metadata: MetadataClient) -> Self {
        Self { metadata }
    }
}

/// Run a command to completion, turning a non-zero exit into an error
async fn run_command(
    program: &str,
    args: &[&str],
    env: &[(&str, &str)],
) -> Result<std::process::Output, InfraError> {
    debug!("Running {} {}", program, args.join(" "));

    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in env {
        command.env(key, value);
    }

    let output = command
        .output()
        .await
        .map_err(|e| InfraError::Command(format!("{}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InfraError::Command(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }

    Ok(output)
}

#[async_trait]
impl Host for SystemHost {
    async fn path_exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    async fn resolve_glob(&self, pattern: &str) -> Vec<PathBuf> {
        let pattern_path = Path::new(pattern);
        let (Some(dir), Some(file_pattern)) = (
            pattern_path.parent(),
            pattern_path.file_name().and_then(|f| f.to_str()),
        ) else {
            return Vec::new();
        };

        let Ok(mut entries) = fs::read_dir(dir).await else {
            return Vec::new();
        };

        let mut resolved = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !wildcard_match(file_pattern, name) {
                continue;
            }
            match fs::canonicalize(entry.path()).await {
                Ok(target) => resolved.push(target),
                Err(e) => warn!("Cannot resolve {}: {}", entry.path().display(), e),
            }
        }

        resolved.sort();
        resolved.dedup();
        resolved
    }

    async fn is_block_device(&self, path: &Path) -> bool {
        fs::metadata(path)
            .await
            .is_ok_and(|m| m.file_type().is_block_device())
    }

    async fn has_filesystem(&self, device: &Path) -> bool {
        let device = device.to_string_lossy().into_owned();
        run_command("blkid", &[device.as_str()], &[]).await.is_ok()
    }

    async fn format(&self, device: &Path, filesystem: &str) -> Result<(), InfraError> {
        let device = device.to_string_lossy().into_owned();
        run_command("mkfs", &["-t", filesystem, "-q", device.as_str()], &[]).await?;
        Ok(())
    }

    async fn filesystem_uuid(&self, device: &Path) -> Result<String, InfraError> {
        let device = device.to_string_lossy().into_owned();
        let output = run_command("blkid", &["-s", "UUID", "-o", "value", device.as_str()], &[]).await?;
        let uuid = String::from_utf8_lossy(&output.stdout).trim().to_string();

        if uuid.is_empty() {
            return Err(InfraError::Command(format!("{} has no filesystem UUID", device)));
        }
        Ok(uuid)
    }

    async fn create_dir_all(&self, path: &Path) -> Result<(), InfraError> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn append_line(&self, file: &Path, line: &str) -> Result<bool, InfraError> {
        let existing = match fs::read_to_string(file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        if existing.lines().any(|l| l.trim() == line) {
            return Ok(false);
        }

        let mut handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .await?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            handle.write_all(b"\n").await?;
        }
        handle.write_all(line.as_bytes()).await?;
        handle.write_all(b"\n").await?;
        handle.flush().await?;
        Ok(true)
    }

    async fn mount(
        &self,
        source: &str,
        mount_point: &Path,
        filesystem: &str,
        options: &str,
    ) -> Result<(), InfraError> {
        let mount_point = mount_point.to_string_lossy().into_owned();
        run_command(
            "mount",
            &["-t", filesystem, "-o", options, source, mount_point.as_str()],
            &[],
        )
        .await?;
        Ok(())
    }

    async fn set_owner(&self, path: &Path, owner: &str) -> Result<(), InfraError> {
        let path = path.to_string_lossy().into_owned();
        run_command("chown", &[owner, path.as_str()], &[]).await?;
        Ok(())
    }

    async fn set_mode(&self, path: &Path, mode: &str) -> Result<(), InfraError> {
        let path = path.to_string_lossy().into_owned();
        run_command("chmod", &[mode, path.as_str()], &[]).await?;
        Ok(())
    }

    async fn run(
        &self,
        program: &str,
        args: &[&str],
        env: &[(&str, &str)],
    ) -> Result<(), InfraError> {
        run_command(program, args, env).await?;
        Ok(())
    }

    async fn run_shell(&self, command: &str) -> Result<(), InfraError> {
        run_command("bash", &["-c", command], &[]).await?;
        Ok(())
    }

    async fn public_ipv4(&self) -> Option<String> {
        match self.metadata.public_ipv4().await {
            Ok(ip) => Some(ip.to_string()),
            Err(e) => {
                warn!("Public IPv4 lookup failed: {}", e);
                None
            }
        }
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
