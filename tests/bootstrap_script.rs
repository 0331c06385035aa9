//! Runs rendered bootstrap script sections under bash

use magicmail_infra::bootstrap::{BootstrapParams, BootstrapScript, Section};
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Run a script file with bash, or `None` when bash is unavailable
fn run_bash(args: &[&str], script: &Path) -> Option<Output> {
    match Command::new("bash").args(args).arg(script).output() {
        Ok(output) => Some(output),
        Err(e) => {
            eprintln!("skipping: cannot run bash: {}", e);
            None
        }
    }
}

fn sandboxed_params(root: &Path) -> BootstrapParams {
    BootstrapParams {
        mount_point: root.join("var/opt/gitlab"),
        wait_device: root.join("dev/nvme1n1"),
        device_by_id_glob: root
            .join("dev/disk/by-id/nvme-Amazon_Elastic_Block_Store_*")
            .display()
            .to_string(),
        fallback_device: root.join("dev/nvme1n1"),
        wait_seconds: 1,
        fstab_path: root.join("etc/fstab"),
        ..BootstrapParams::default()
    }
}

/// With no data volume present the script falls back to the root volume
/// and still creates the mount directory
#[test]
fn test_volume_section_falls_back_to_root_volume() {
    let temp = TempDir::new().unwrap();
    let params = sandboxed_params(temp.path());
    let mount_point = params.mount_point.clone();
    let fstab = params.fstab_path.clone();

    let script = BootstrapScript::new(params)
        .unwrap()
        .user_data(Section::Volume)
        .unwrap()
        .render();
    let script_path = temp.path().join("volume.sh");
    std::fs::write(&script_path, script).unwrap();

    let Some(output) = run_bash(&[], &script_path) else {
        return;
    };
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("ERROR: data volume not found! Using root volume"));
    assert!(!stdout.contains("Found data volume"));
    assert!(mount_point.is_dir());
    assert!(!fstab.exists());
}

#[test]
fn test_full_script_is_valid_bash() {
    let temp = TempDir::new().unwrap();
    let script = BootstrapScript::new(BootstrapParams::default())
        .unwrap()
        .user_data(Section::All)
        .unwrap()
        .render();
    let script_path = temp.path().join("user-data.sh");
    std::fs::write(&script_path, &script).unwrap();

    let Some(output) = run_bash(&["-n"], &script_path) else {
        return;
    };
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let volume = script.find("Formatting and Mounting Data Volume").unwrap();
    let install = script.find("Installing Dependencies").unwrap();
    assert!(volume < install);
    assert!(script.contains("chown git:git \"/var/opt/gitlab\""));
}
