/// Test utilities for conditional test execution
use std::process::Command;

pub fn has_docker() -> bool {
    Command::new("docker")
        .arg("info")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn has_qemu_img() -> bool {
    Command::new("qemu-img")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn has_qemu_system() -> bool {
    Command::new("qemu-system-x86_64")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn has_kvm() -> bool {
    cfg!(target_os = "linux") && std::path::Path::new("/dev/kvm").exists()
}

/// Macro to skip tests when requirements aren't met
#[macro_export]
macro_rules! require_docker {
    () => {
        if !$crate::test_utils::has_docker() {
            eprintln!("Test ignored: Docker not available");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_qemu_img {
    () => {
        if !$crate::test_utils::has_qemu_img() {
            eprintln!("Test ignored: qemu-img not available");
            return;
        }
    };
}
