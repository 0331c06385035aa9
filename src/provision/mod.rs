//! Native bootstrap runner
//!
//! Runs the same first-boot sequence as the rendered bootstrap script, on the
//! instance itself, with structured logging and a report of what happened.
//! All system effects go through the [`Host`] trait.
//!
//! Failures are tolerated the way the script tolerates them: a missing device
//! degrades to the root volume, and a failed host step is logged and
//! recorded while later steps still run.

pub mod host;
pub mod metadata;

pub use host::SystemHost;
pub use metadata::MetadataClient;

use crate::bootstrap::BootstrapParams;
use crate::InfraError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interval between readiness polls of the data device
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// System effects needed by the bootstrap sequence
#[async_trait]
pub trait Host: Send + Sync {
    /// Whether anything exists at `path`
    async fn path_exists(&self, path: &Path) -> bool;

    /// Canonical targets of every path matching a glob with one `*`
    async fn resolve_glob(&self, pattern: &str) -> Vec<PathBuf>;

    async fn is_block_device(&self, path: &Path) -> bool;

    /// Whether the device carries a filesystem signature
    async fn has_filesystem(&self, device: &Path) -> bool;

    async fn format(&self, device: &Path, filesystem: &str) -> Result<(), InfraError>;

    async fn filesystem_uuid(&self, device: &Path) -> Result<String, InfraError>;

    async fn create_dir_all(&self, path: &Path) -> Result<(), InfraError>;

    /// Append `line` unless already present; returns whether it was appended
    async fn append_line(&self, file: &Path, line: &str) -> Result<bool, InfraError>;

    /// Mount `source` (a device or `UUID=...`) without consulting fstab
    async fn mount(
        &self,
        source: &str,
        mount_point: &Path,
        filesystem: &str,
        options: &str,
    ) -> Result<(), InfraError>;

    async fn set_owner(&self, path: &Path, owner: &str) -> Result<(), InfraError>;

    async fn set_mode(&self, path: &Path, mode: &str) -> Result<(), InfraError>;

    /// Run a program with extra environment variables
    async fn run(&self, program: &str, args: &[&str], env: &[(&str, &str)])
    -> Result<(), InfraError>;

    /// Run a shell command line
    async fn run_shell(&self, command: &str) -> Result<(), InfraError>;

    /// Public IPv4 as reported by the instance metadata service
    async fn public_ipv4(&self) -> Option<String>;

    async fn sleep(&self, duration: Duration);
}

/// Outcome of a bootstrap run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Whether the wait device appeared within the poll window
    pub device_ready: bool,
    /// Data device that was mounted, `None` in root-volume fallback
    pub data_device: Option<PathBuf>,
    /// Whether the device was formatted in this run
    pub formatted: bool,
    /// Whether a new fstab entry was written
    pub fstab_updated: bool,
    /// Address used as the service's external URL host
    pub external_address: Option<String>,
    /// Steps that failed but did not stop the run
    pub failed_steps: Vec<String>,
}

impl BootstrapReport {
    pub fn is_degraded(&self) -> bool {
        self.data_device.is_none() || !self.failed_steps.is_empty()
    }
}

/// Runs the bootstrap sequence against a [`Host`]
pub struct BootstrapRunner<'a, H: Host + ?Sized> {
    host: &'a H,
    params: &'a BootstrapParams,
}

impl<'a, H: Host + ?Sized> BootstrapRunner<'a, H> {
    pub fn new(host: &'a H, params: &'a BootstrapParams) -> Self {
        Self { host, params }
    }

    /// Run every step
    pub async fn run(&self) -> Result<BootstrapReport, InfraError> {
        let mut report = self.prepare_volume().await?;
        self.install(&mut report).await;
        Ok(report)
    }

    /// Steps 1-5: wait, resolve, format, register and mount, fallback
    ///
    /// Only invalid parameters are an error. Failed host steps are recorded in
    /// the report and later steps still run.
    pub async fn prepare_volume(&self) -> Result<BootstrapReport, InfraError> {
        self.params.validate()?;
        let mut report = BootstrapReport {
            device_ready: self.wait_for_device().await,
            ..Default::default()
        };
        let mount_point = &self.params.mount_point;

        let Some(device) = self.resolve_device().await else {
            warn!(
                "ERROR: data volume not found! Using root volume for {}",
                mount_point.display()
            );
            self.step(&mut report, "create mount point", self.host.create_dir_all(mount_point))
                .await;
            return Ok(report);
        };

        info!("Found data volume at {}", device.display());

        if !self.host.has_filesystem(&device).await {
            info!(
                "Formatting {} with {}",
                device.display(),
                self.params.filesystem
            );
            let formatted = self
                .step(&mut report, "format", self.host.format(&device, &self.params.filesystem))
                .await;
            report.formatted = formatted.is_some();
        }

        self.step(&mut report, "create mount point", self.host.create_dir_all(mount_point))
            .await;

        let uuid = self
            .step(&mut report, "read filesystem uuid", self.host.filesystem_uuid(&device))
            .await;
        let source = match &uuid {
            Some(uuid) => {
                let entry = fstab_entry(uuid, self.params);
                let appended = self
                    .step(
                        &mut report,
                        "register in fstab",
                        self.host.append_line(&self.params.fstab_path, &entry),
                    )
                    .await;
                report.fstab_updated = appended == Some(true);
                if appended == Some(false) {
                    debug!("fstab already contains {}", entry);
                }
                format!("UUID={}", uuid)
            }
            None => device.display().to_string(),
        };

        self.step(
            &mut report,
            "mount",
            self.host.mount(
                &source,
                mount_point,
                &self.params.filesystem,
                &self.params.mount_options,
            ),
        )
        .await;

        report.data_device = Some(device);
        Ok(report)
    }

    /// Poll for the wait device; a timeout is logged and otherwise ignored
    async fn wait_for_device(&self) -> bool {
        let device = &self.params.wait_device;
        for attempt in 1..=self.params.wait_seconds {
            if self.host.path_exists(device).await {
                debug!("{} present after {} polls", device.display(), attempt);
                return true;
            }
            self.host.sleep(POLL_INTERVAL).await;
        }

        warn!(
            "{} did not appear within {}s, continuing",
            device.display(),
            self.params.wait_seconds
        );
        false
    }

    /// The single by-id match if it is a block device, else the fallback name
    async fn resolve_device(&self) -> Option<PathBuf> {
        let matches = self.host.resolve_glob(&self.params.device_by_id_glob).await;
        if let [only] = matches.as_slice()
            && self.host.is_block_device(only).await
        {
            return Some(only.clone());
        }
        if matches.len() > 1 {
            debug!(
                "{} matched {} devices, using fallback",
                self.params.device_by_id_glob,
                matches.len()
            );
        }

        let fallback = &self.params.fallback_device;
        if self.host.is_block_device(fallback).await {
            Some(fallback.clone())
        } else {
            None
        }
    }

    /// Steps 6-7: packages, service and ownership; failures are recorded, never fatal
    pub async fn install(&self, report: &mut BootstrapReport) {
        const NONINTERACTIVE: (&str, &str) = ("DEBIAN_FRONTEND", "noninteractive");
        let params = self.params;

        info!("Installing dependencies and setting up {} repository", params.service_name);
        let prerequisites: Vec<&str> = params.prerequisites.iter().map(String::as_str).collect();
        let mut install_args = vec!["install", "-y"];
        install_args.extend(prerequisites);

        self.step(report, "apt-get update", self.host.run("apt-get", &["update", "-y"], &[NONINTERACTIVE]))
            .await;
        self.step(report, "install prerequisites", self.host.run("apt-get", &install_args, &[NONINTERACTIVE]))
            .await;
        let repo_setup = format!("curl -L {} | bash", params.repository_script_url);
        self.step(report, "repository setup", self.host.run_shell(&repo_setup))
            .await;
        self.step(report, "apt-get clean", self.host.run("apt-get", &["clean"], &[]))
            .await;

        info!("Starting {} installation", params.service_name);
        let address = match self.host.public_ipv4().await {
            Some(ip) => ip,
            None => {
                warn!("Public address unavailable, using {}", params.fallback_address);
                params.fallback_address.clone()
            }
        };
        let external_url = format!("http://{}", address);
        report.external_address = Some(address);

        self.step(
            report,
            "install service",
            self.host.run(
                "apt-get",
                &["install", "-y", params.service_package.as_str()],
                &[NONINTERACTIVE, ("EXTERNAL_URL", external_url.as_str())],
            ),
        )
        .await;

        let mount_point = &params.mount_point;
        self.step(report, "set owner", self.host.set_owner(mount_point, &params.owner))
            .await;
        self.step(report, "set mode", self.host.set_mode(mount_point, &params.mode))
            .await;

        info!("Running post-install configuration");
        self.step(report, "post-install", self.host.run_shell(&params.post_install_command))
            .await;
    }

    /// Await a step, recording its failure instead of propagating it
    async fn step<T, F>(&self, report: &mut BootstrapReport, name: &str, action: F) -> Option<T>
    where
        F: std::future::Future<Output = Result<T, InfraError>>,
    {
        match action.await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Step '{}' failed: {}", name, e);
                report.failed_steps.push(name.to_string());
                None
            }
        }
    }
}

/// fstab line registering the data volume by UUID
pub fn fstab_entry(uuid: &str, params: &BootstrapParams) -> String {
    format!(
        "UUID={} {} {} {} 0 2",
        uuid,
        params.mount_point.display(),
        params.filesystem,
        params.mount_options
    )
}

/// Match a file name against a pattern with at most one `*`
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}
