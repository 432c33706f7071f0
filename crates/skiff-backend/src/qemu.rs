//! QEMU-backed virtual machines: qcow2 disk creation via `qemu-img` and a
//! supervised `qemu-system-x86_64` child process per resource.
//!
//! ```text
//! provision(id, VmSpec)
//!     ├─► qemu-img create -f qcow2 <storage>/<name>.qcow2 <size>G
//!     └─► tokio::process::Command  →  qemu-system child
//!             └─► VmEntry { child, disk_path }
//!                     ├─► exit-watcher task (try_wait poll)
//!                     └─► stop()  (SIGTERM, then SIGKILL after the grace period)
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use skiff_common::{
    ProvisionOutcome, ResourceBackend, ResourceKind, ResourceSpec, Result, SkiffError, VmSpec,
};

pub const DISK_EXT: &str = "qcow2";

/// QEMU exits within milliseconds on a bad ISO or missing KVM; wait this long
/// before declaring the child alive.
const SPAWN_GRACE: Duration = Duration::from_millis(300);
const EXIT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct QemuConfig {
    pub qemu_img: PathBuf,
    pub qemu_system: PathBuf,
    /// Directory holding all disk images.
    pub storage_dir: PathBuf,
    pub enable_kvm: bool,
    /// Display backend handed to QEMU (`gtk`, `sdl`, `none`, ...).
    pub display: String,
    /// How long a VM gets between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            qemu_img: PathBuf::from("qemu-img"),
            qemu_system: PathBuf::from("qemu-system-x86_64"),
            storage_dir: PathBuf::from("vm_storage"),
            enable_kvm: true,
            display: "gtk".to_string(),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Arguments for `qemu-img` to create a qcow2 disk of `size_gb` gibibytes.
pub fn create_disk_args(disk_path: &Path, size_gb: u32) -> Vec<OsString> {
    vec![
        OsString::from("create"),
        OsString::from("-f"),
        OsString::from(DISK_EXT),
        disk_path.as_os_str().to_os_string(),
        OsString::from(format!("{size_gb}G")),
    ]
}

/// Arguments for `qemu-system-x86_64` to boot a VM from the given spec.
pub fn launch_args(spec: &VmSpec, disk_path: &Path, enable_kvm: bool, display: &str) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("-m"),
        OsString::from(spec.ram_mb.to_string()),
        OsString::from("-smp"),
        OsString::from(spec.cpu_cores.to_string()),
        OsString::from("-hda"),
        disk_path.as_os_str().to_os_string(),
    ];
    if enable_kvm {
        args.push(OsString::from("-enable-kvm"));
    }
    args.push(OsString::from("-display"));
    args.push(OsString::from(display));
    if let Some(iso) = &spec.iso_path {
        args.push(OsString::from("-cdrom"));
        args.push(iso.as_os_str().to_os_string());
        args.push(OsString::from("-boot"));
        args.push(OsString::from("d"));
    }
    args
}

fn tool_error(tool: &Path, err: std::io::Error) -> SkiffError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SkiffError::BackendUnavailable(format!("'{}' not found on PATH", tool.display()))
    } else {
        SkiffError::Io(err)
    }
}

struct VmEntry {
    disk_path: PathBuf,
    child: Option<Arc<Mutex<Option<Child>>>>,
    pid: Option<u32>,
}

/// Supervised QEMU processes, one per provisioned VM resource.
pub struct QemuBackend {
    config: QemuConfig,
    vms: Arc<DashMap<String, Arc<VmEntry>>>,
}

impl QemuBackend {
    pub fn new(config: QemuConfig) -> Self {
        Self {
            config,
            vms: Arc::new(DashMap::new()),
        }
    }

    /// Path the disk image for `name` lives at. The `.qcow2` extension is
    /// appended when missing and preserved when present.
    pub fn disk_path_for(&self, name: &str) -> PathBuf {
        let file = if name.ends_with(&format!(".{DISK_EXT}")) {
            name.to_string()
        } else {
            format!("{name}.{DISK_EXT}")
        };
        self.config.storage_dir.join(file)
    }

    /// Create a qcow2 disk image. Refuses to overwrite an existing one.
    #[instrument(skip(self))]
    pub async fn create_disk(&self, name: &str, size_gb: u32) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.storage_dir).await?;
        let path = self.disk_path_for(name);
        if path.exists() {
            return Err(SkiffError::ResourceConflict(format!(
                "disk '{}' already exists",
                path.display()
            )));
        }

        let output = Command::new(&self.config.qemu_img)
            .args(create_disk_args(&path, size_gb))
            .output()
            .await
            .map_err(|e| tool_error(&self.config.qemu_img, e))?;
        if !output.status.success() {
            return Err(SkiffError::Internal(format!(
                "qemu-img create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(disk = %path.display(), size_gb, "disk image created");
        Ok(path)
    }

    async fn launch(&self, id: &str, spec: &VmSpec, disk_path: &Path) -> Result<ProvisionOutcome> {
        let args = launch_args(spec, disk_path, self.config.enable_kvm, &self.config.display);
        debug!(id, ?args, "launching qemu");

        let mut cmd = Command::new(&self.config.qemu_system);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd
            .spawn()
            .map_err(|e| tool_error(&self.config.qemu_system, e))?;
        let pid = child.id();

        // Register before any await so a cancelled provision can still reap
        // the child.
        let slot = Arc::new(Mutex::new(Some(child)));
        self.vms.insert(
            id.to_string(),
            Arc::new(VmEntry {
                disk_path: disk_path.to_path_buf(),
                child: Some(slot.clone()),
                pid,
            }),
        );

        tokio::time::sleep(SPAWN_GRACE).await;
        {
            let mut guard = slot.lock().await;
            if let Some(child) = guard.as_mut() {
                if let Some(status) = child.try_wait().map_err(SkiffError::Io)? {
                    guard.take();
                    return Err(SkiffError::Internal(format!(
                        "qemu exited immediately with {status}"
                    )));
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        spawn_exit_watcher(id.to_string(), slot, self.vms.clone(), tx);

        info!(id, pid = ?pid, disk = %disk_path.display(), ram_mb = spec.ram_mb, cpu_cores = spec.cpu_cores, "vm launched");
        Ok(ProvisionOutcome {
            backend_ref: format!(
                "pid {} disk {}",
                pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
                disk_path.display()
            ),
            exited: Some(rx),
        })
    }
}

fn spawn_exit_watcher(
    id: String,
    slot: Arc<Mutex<Option<Child>>>,
    vms: Arc<DashMap<String, Arc<VmEntry>>>,
    tx: oneshot::Sender<Option<String>>,
) {
    tokio::spawn(async move {
        let notice = loop {
            {
                let mut guard = slot.lock().await;
                match guard.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            guard.take();
                            break if status.success() {
                                None
                            } else {
                                Some(format!("qemu exited with {status}"))
                            };
                        }
                        Ok(None) => {}
                        Err(e) => break Some(format!("wait on qemu child failed: {e}")),
                    },
                    // stop() or reap() already collected the child
                    None => break None,
                }
            }
            tokio::time::sleep(EXIT_POLL).await;
        };
        vms.remove(&id);
        debug!(%id, ?notice, "vm exit observed");
        let _ = tx.send(notice);
    });
}

#[async_trait]
impl ResourceBackend for QemuBackend {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Vm
    }

    #[instrument(skip(self, spec), fields(id = %id))]
    async fn provision(&self, id: &str, spec: &ResourceSpec) -> Result<ProvisionOutcome> {
        let spec = match spec {
            ResourceSpec::Vm(v) => v,
            other => {
                return Err(SkiffError::InvalidSpec(format!(
                    "vm backend cannot provision a {}",
                    other.kind()
                )))
            }
        };

        let disk_path = self.disk_path_for(&spec.vm_name);
        // A conflicting disk fails here, before anything needs cleanup; a
        // pre-existing disk is never ours to delete.
        self.create_disk(&spec.vm_name, spec.disk_size_gb).await?;

        match self.launch(id, spec, &disk_path).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // The child (if any) and the disk belong to this failed
                // attempt.
                self.reap(id).await;
                let _ = tokio::fs::remove_file(&disk_path).await;
                Err(err)
            }
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let entry = self
            .vms
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SkiffError::NotFound(format!("vm '{id}'")))?;
        let Some(slot) = entry.child.clone() else {
            return Ok(());
        };

        // Take the child out of the slot; the exit watcher sees the empty
        // slot and finishes.
        let mut guard = slot.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        drop(guard);

        #[cfg(unix)]
        {
            if let Some(pid) = entry.pid {
                // Ask for a graceful shutdown first.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                let deadline = tokio::time::Instant::now() + self.config.stop_grace;
                while tokio::time::Instant::now() < deadline {
                    if let Some(status) = child.try_wait().map_err(SkiffError::Io)? {
                        debug!(id, ?status, "vm exited after SIGTERM");
                        return Ok(());
                    }
                    tokio::time::sleep(EXIT_POLL).await;
                }
                warn!(id, "vm ignored SIGTERM; killing");
            }
        }

        child.kill().await.map_err(SkiffError::Io)?;
        info!(id, "vm killed");
        Ok(())
    }

    async fn probe(&self, id: &str) -> Result<bool> {
        let Some(entry) = self.vms.get(id).map(|e| e.value().clone()) else {
            return Ok(false);
        };
        let Some(slot) = entry.child.clone() else {
            return Ok(false);
        };
        let mut guard = slot.lock().await;
        match guard.as_mut() {
            Some(child) => Ok(child.try_wait().map_err(SkiffError::Io)?.is_none()),
            None => Ok(false),
        }
    }

    async fn reap(&self, id: &str) {
        let Some((_, entry)) = self.vms.remove(id) else {
            return;
        };
        if let Some(slot) = &entry.child {
            let mut guard = slot.lock().await;
            if let Some(mut child) = guard.take() {
                if let Err(e) = child.kill().await {
                    warn!(id, error = %e, "failed to kill vm during reap");
                }
            }
        }
        // The disk belongs to this provision attempt; a cancelled or failed
        // provision must not leave it behind to conflict with a retry.
        match tokio::fs::remove_file(&entry.disk_path).await {
            Ok(()) => info!(id, disk = %entry.disk_path.display(), "disk removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(id, disk = %entry.disk_path.display(), error = %e, "failed to remove disk during reap")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> VmSpec {
        VmSpec {
            vm_name: "test".to_string(),
            ram_mb: 1024,
            cpu_cores: 2,
            disk_size_gb: 10,
            iso_path: None,
        }
    }

    fn backend_with_storage(dir: &Path) -> QemuBackend {
        QemuBackend::new(QemuConfig {
            storage_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    #[test]
    fn disk_extension_appended_when_missing() {
        let backend = QemuBackend::new(QemuConfig::default());
        assert_eq!(
            backend.disk_path_for("test"),
            PathBuf::from("vm_storage/test.qcow2")
        );
        assert_eq!(
            backend.disk_path_for("test.qcow2"),
            PathBuf::from("vm_storage/test.qcow2")
        );
    }

    #[test]
    fn disk_creation_request_is_exact() {
        let args = create_disk_args(Path::new("vm_storage/test.qcow2"), 10);
        assert_eq!(
            args,
            vec![
                OsString::from("create"),
                OsString::from("-f"),
                OsString::from("qcow2"),
                OsString::from("vm_storage/test.qcow2"),
                OsString::from("10G"),
            ]
        );
    }

    #[test]
    fn launch_request_carries_ram_and_cpu() {
        let args = launch_args(&test_spec(), Path::new("vm_storage/test.qcow2"), true, "gtk");
        let strs: Vec<&std::ffi::OsStr> = args.iter().map(|a| a.as_os_str()).collect();
        let pos_m = strs.iter().position(|a| *a == "-m").unwrap();
        assert_eq!(strs[pos_m + 1], "1024");
        let pos_smp = strs.iter().position(|a| *a == "-smp").unwrap();
        assert_eq!(strs[pos_smp + 1], "2");
        assert!(strs.contains(&std::ffi::OsStr::new("-enable-kvm")));
        assert!(!strs.contains(&std::ffi::OsStr::new("-cdrom")));
    }

    #[test]
    fn launch_attaches_iso_as_boot_cdrom() {
        let mut spec = test_spec();
        spec.iso_path = Some(PathBuf::from("/isos/ubuntu.iso"));
        let args = launch_args(&spec, Path::new("vm_storage/test.qcow2"), false, "none");
        let strs: Vec<&std::ffi::OsStr> = args.iter().map(|a| a.as_os_str()).collect();
        let pos = strs.iter().position(|a| *a == "-cdrom").unwrap();
        assert_eq!(strs[pos + 1], "/isos/ubuntu.iso");
        assert!(strs.contains(&std::ffi::OsStr::new("-boot")));
        assert!(!strs.contains(&std::ffi::OsStr::new("-enable-kvm")));
    }

    #[tokio::test]
    async fn existing_disk_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_storage(dir.path());
        std::fs::write(dir.path().join("test.qcow2"), b"stub").unwrap();
        let err = backend.create_disk("test", 10).await.unwrap_err();
        assert!(matches!(err, SkiffError::ResourceConflict(_)));
    }

    #[tokio::test]
    async fn missing_qemu_img_is_backend_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = QemuBackend::new(QemuConfig {
            qemu_img: PathBuf::from("/nonexistent/qemu-img"),
            storage_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let err = backend.create_disk("test", 10).await.unwrap_err();
        assert!(matches!(err, SkiffError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn probe_of_unknown_vm_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_storage(dir.path());
        assert!(!backend.probe("nope").await.unwrap());
    }
}
