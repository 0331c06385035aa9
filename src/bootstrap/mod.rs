//! First-boot bootstrap script
//!
//! The script prepares the data volume and installs the GitLab service:
//! 1. Wait for the data device to appear (bounded, never fatal)
//! 2. Resolve the device through its stable by-id link, else a fixed name
//! 3. Format only when no filesystem signature exists
//! 4. Create the mount point, register it in fstab by UUID, mount it by UUID
//! 5. Without a device, fall back to the root volume with a warning
//! 6. Install prerequisites, the package repository and the service, using the
//!    instance's public address as the external URL
//! 7. Fix ownership and mode of the mount point (the service package creates
//!    the owning user), then run the post-install command
//!
//! Every substitution point lives in [`BootstrapParams`] and is rendered as a
//! literal into the script, so no step depends on shell variable expansion of
//! configuration values.

use crate::provision::metadata::{IMDS_BASE_URL, PUBLIC_IPV4_PATH, metadata_path_url};
use crate::template::TemplateRenderer;
use crate::userdata::UserData;
use crate::InfraError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const VOLUME_TEMPLATE: &str = include_str!("volume.sh.j2");
const INSTALL_TEMPLATE: &str = include_str!("install.sh.j2");

/// Named substitution points of the bootstrap sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapParams {
    /// Where the data volume is mounted
    pub mount_point: PathBuf,
    /// Device polled for readiness
    pub wait_device: PathBuf,
    /// Glob of stable by-id links to the data volume
    pub device_by_id_glob: String,
    /// Device used when by-id resolution fails
    pub fallback_device: PathBuf,
    pub filesystem: String,
    pub mount_options: String,
    /// Number of one-second polls for `wait_device`
    pub wait_seconds: u32,
    pub fstab_path: PathBuf,
    /// `user:group` owning the mount point
    pub owner: String,
    /// Octal mode of the mount point
    pub mode: String,
    pub service_name: String,
    pub prerequisites: Vec<String>,
    pub repository_script_url: String,
    pub service_package: String,
    /// Instance metadata service endpoint; the script and the native runner
    /// both look up the public IPv4 here
    pub metadata_endpoint: String,
    /// Address advertised when the metadata lookup fails
    pub fallback_address: String,
    pub post_install_command: String,
}

impl Default for BootstrapParams {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/var/opt/gitlab"),
            wait_device: PathBuf::from("/dev/nvme1n1"),
            device_by_id_glob: "/dev/disk/by-id/nvme-Amazon_Elastic_Block_Store_*".to_string(),
            fallback_device: PathBuf::from("/dev/nvme1n1"),
            filesystem: "ext4".to_string(),
            mount_options: "defaults,nofail,noatime".to_string(),
            wait_seconds: 60,
            fstab_path: PathBuf::from("/etc/fstab"),
            owner: "git:git".to_string(),
            mode: "755".to_string(),
            service_name: "GitLab CE".to_string(),
            prerequisites: ["curl", "ca-certificates", "tzdata", "perl"]
                .into_iter()
                .map(String::from)
                .collect(),
            repository_script_url:
                "https://packages.gitlab.com/install/repositories/gitlab/gitlab-ce/script.deb.sh"
                    .to_string(),
            service_package: "gitlab-ce".to_string(),
            metadata_endpoint: IMDS_BASE_URL.to_string(),
            fallback_address: "127.0.0.1".to_string(),
            post_install_command: "gitlab-ctl reconfigure".to_string(),
        }
    }
}

impl BootstrapParams {
    /// Reject values that would break out of the script's quoting
    pub fn validate(&self) -> Result<(), InfraError> {
        let paths = [
            ("mount_point", &self.mount_point),
            ("wait_device", &self.wait_device),
            ("fallback_device", &self.fallback_device),
            ("fstab_path", &self.fstab_path),
        ];
        for (field, path) in paths {
            let value = path.to_str().ok_or_else(|| {
                InfraError::Template(format!("{} is not valid UTF-8", field))
            })?;
            if !path.is_absolute() {
                return Err(InfraError::Template(format!(
                    "{} must be an absolute path, got '{}'",
                    field, value
                )));
            }
            check_shell_safe(field, value)?;
        }

        let words = [
            ("device_by_id_glob", self.device_by_id_glob.as_str()),
            ("filesystem", self.filesystem.as_str()),
            ("mount_options", self.mount_options.as_str()),
            ("owner", self.owner.as_str()),
            ("service_name", self.service_name.as_str()),
            ("repository_script_url", self.repository_script_url.as_str()),
            ("service_package", self.service_package.as_str()),
            ("metadata_endpoint", self.metadata_endpoint.as_str()),
            ("fallback_address", self.fallback_address.as_str()),
        ];
        for (field, value) in words {
            if value.trim().is_empty() {
                return Err(InfraError::Template(format!("{} must not be empty", field)));
            }
            check_shell_safe(field, value)?;
        }
        for package in &self.prerequisites {
            check_shell_safe("prerequisites", package)?;
        }
        if self.post_install_command.contains('\n') {
            return Err(InfraError::Template(
                "post_install_command must be a single line".to_string(),
            ));
        }

        if self.mode.is_empty() || !self.mode.chars().all(|c| ('0'..='7').contains(&c)) {
            return Err(InfraError::Template(format!(
                "mode must be octal digits, got '{}'",
                self.mode
            )));
        }
        if self.wait_seconds == 0 {
            return Err(InfraError::Template(
                "wait_seconds must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    fn renderer(&self) -> TemplateRenderer {
        let mut renderer = TemplateRenderer::new();
        renderer.add_var("mount_point", self.mount_point.display().to_string());
        renderer.add_var("wait_device", self.wait_device.display().to_string());
        renderer.add_var("device_by_id_glob", self.device_by_id_glob.as_str());
        renderer.add_var("fallback_device", self.fallback_device.display().to_string());
        renderer.add_var("filesystem", self.filesystem.as_str());
        renderer.add_var("mount_options", self.mount_options.as_str());
        renderer.add_var("wait_seconds", self.wait_seconds);
        renderer.add_var("fstab_path", self.fstab_path.display().to_string());
        renderer.add_var("owner", self.owner.as_str());
        renderer.add_var("mode", self.mode.as_str());
        renderer.add_var("service_name", self.service_name.as_str());
        renderer.add_serialized("prerequisites", &self.prerequisites);
        renderer.add_var("repository_script_url", self.repository_script_url.as_str());
        renderer.add_var("service_package", self.service_package.as_str());
        renderer.add_var(
            "public_ipv4_url",
            metadata_path_url(&self.metadata_endpoint, PUBLIC_IPV4_PATH),
        );
        renderer.add_var("fallback_address", self.fallback_address.as_str());
        renderer.add_var("post_install_command", self.post_install_command.as_str());
        renderer
    }
}

fn check_shell_safe(field: &str, value: &str) -> Result<(), InfraError> {
    const FORBIDDEN: &[char] = &['"', '\'', '`', '$', '\\', '\n', '\r', ';', '&', '|', '<', '>'];
    if let Some(c) = value.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(InfraError::Template(format!(
            "{} contains unsupported character {:?}: '{}'",
            field, c, value
        )));
    }
    Ok(())
}

/// Part of the bootstrap script to render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Section {
    /// Steps 1-5: data volume preparation
    Volume,
    /// Steps 6-7: packages, service and ownership
    Install,
    #[default]
    All,
}

impl std::str::FromStr for Section {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "volume" => Ok(Self::Volume),
            "install" => Ok(Self::Install),
            "all" => Ok(Self::All),
            other => Err(InfraError::Template(format!("Unknown section '{}'", other))),
        }
    }
}

/// Rendered bootstrap script
#[derive(Debug, Clone)]
pub struct BootstrapScript {
    params: BootstrapParams,
}

impl BootstrapScript {
    pub fn new(params: BootstrapParams) -> Result<Self, InfraError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &BootstrapParams {
        &self.params
    }

    /// Render one section (or both) as a script body without shebang
    pub fn render_body(&self, section: Section) -> Result<String, InfraError> {
        let renderer = self.params.renderer();
        match section {
            Section::Volume => renderer.render("volume.sh", VOLUME_TEMPLATE),
            Section::Install => renderer.render("install.sh", INSTALL_TEMPLATE),
            Section::All => {
                let mut body = renderer.render("volume.sh", VOLUME_TEMPLATE)?;
                body.push_str(&renderer.render("install.sh", INSTALL_TEMPLATE)?);
                Ok(body)
            }
        }
    }

    /// Linux user-data carrying the rendered section
    pub fn user_data(&self, section: Section) -> Result<UserData, InfraError> {
        let mut user_data = UserData::for_linux();
        user_data.add_script(&self.render_body(section)?);
        Ok(user_data)
    }
}
