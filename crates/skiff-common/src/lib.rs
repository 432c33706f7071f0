// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

/// Sizing bounds enforced by spec validation before any backend is touched.
pub const MIN_RAM_MB: u32 = 128;
pub const MAX_RAM_MB: u32 = 262_144;
pub const MIN_CPU_CORES: u32 = 1;
pub const MAX_CPU_CORES: u32 = 64;
pub const MIN_DISK_GB: u32 = 1;
pub const MAX_DISK_GB: u32 = 2_048;

#[derive(Error, Debug)]
pub enum SkiffError {
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Build failed: {message}")]
    BuildFailed {
        message: String,
        /// Last few lines of the build log, for diagnosis without replaying
        /// the whole stream.
        log_tail: Vec<String>,
    },

    #[error("Invalid state for operation: resource is {0}")]
    InvalidState(String),

    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Define the primary Result type for skiff operations
pub type Result<T> = std::result::Result<T, SkiffError>;

/// Typed cause recorded when a resource lands in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    BackendUnavailable,
    InvalidSpec,
    ResourceConflict,
    Timeout,
    Cancelled,
    BackendError,
}

impl From<&SkiffError> for FailureCause {
    fn from(err: &SkiffError) -> Self {
        match err {
            SkiffError::InvalidSpec(_) => FailureCause::InvalidSpec,
            SkiffError::BackendUnavailable(_) => FailureCause::BackendUnavailable,
            SkiffError::NotFound(_) => FailureCause::BackendError,
            SkiffError::Timeout(_) => FailureCause::Timeout,
            SkiffError::Cancelled => FailureCause::Cancelled,
            SkiffError::ResourceConflict(_) => FailureCause::ResourceConflict,
            _ => FailureCause::BackendError,
        }
    }
}

impl Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCause::BackendUnavailable => "backend unavailable",
            FailureCause::InvalidSpec => "invalid spec",
            FailureCause::ResourceConflict => "resource conflict",
            FailureCause::Timeout => "timeout",
            FailureCause::Cancelled => "cancelled",
            FailureCause::BackendError => "backend error",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of a tracked resource.
///
/// `Requested → Provisioning → {Running, Failed}`;
/// `Running → Stopping → {Stopped, Failed}`.
/// `Stopped` and `Failed` are terminal; re-provisioning mints a new id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Requested,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed(FailureCause),
}

impl ResourceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceState::Stopped | ResourceState::Failed(_))
    }
}

impl Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceState::Requested => write!(f, "requested"),
            ResourceState::Provisioning => write!(f, "provisioning"),
            ResourceState::Running => write!(f, "running"),
            ResourceState::Stopping => write!(f, "stopping"),
            ResourceState::Stopped => write!(f, "stopped"),
            ResourceState::Failed(cause) => write!(f, "failed ({cause})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Container,
    Vm,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Container => write!(f, "container"),
            ResourceKind::Vm => write!(f, "vm"),
        }
    }
}

fn default_vm_name() -> String {
    "default_vm".to_string()
}
fn default_ram_mb() -> u32 {
    2048
}
fn default_cpu_cores() -> u32 {
    4
}
fn default_disk_size_gb() -> u32 {
    10
}

/// User-supplied description of a virtual machine. Field names match the
/// on-disk JSON config schema; absent fields take the defaults above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    #[serde(default = "default_vm_name")]
    pub vm_name: String,
    #[serde(default = "default_ram_mb")]
    pub ram_mb: u32,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_path: Option<PathBuf>,
}

impl VmSpec {
    /// Load a VM spec from a JSON config file, applying defaults for any
    /// missing field.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SkiffError::NotFound(format!("config file '{}'", path.display()))
            } else {
                SkiffError::Io(e)
            }
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            SkiffError::InvalidSpec(format!("'{}' is not a valid JSON config: {e}", path.display()))
        })
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.vm_name)?;
        if !(MIN_RAM_MB..=MAX_RAM_MB).contains(&self.ram_mb) {
            return Err(SkiffError::InvalidSpec(format!(
                "ram_mb {} outside [{MIN_RAM_MB}, {MAX_RAM_MB}]",
                self.ram_mb
            )));
        }
        if !(MIN_CPU_CORES..=MAX_CPU_CORES).contains(&self.cpu_cores) {
            return Err(SkiffError::InvalidSpec(format!(
                "cpu_cores {} outside [{MIN_CPU_CORES}, {MAX_CPU_CORES}]",
                self.cpu_cores
            )));
        }
        if !(MIN_DISK_GB..=MAX_DISK_GB).contains(&self.disk_size_gb) {
            return Err(SkiffError::InvalidSpec(format!(
                "disk_size_gb {} outside [{MIN_DISK_GB}, {MAX_DISK_GB}]",
                self.disk_size_gb
            )));
        }
        if let Some(iso) = &self.iso_path {
            if !iso.is_file() {
                return Err(SkiffError::InvalidSpec(format!(
                    "iso_path '{}' does not exist",
                    iso.display()
                )));
            }
        }
        Ok(())
    }
}

/// User-supplied description of a container to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<u32>,
}

impl ContainerSpec {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.image.trim().is_empty() {
            return Err(SkiffError::InvalidSpec("image must not be empty".into()));
        }
        if let Some(mem) = self.memory_mb {
            if !(MIN_RAM_MB..=MAX_RAM_MB).contains(&mem) {
                return Err(SkiffError::InvalidSpec(format!(
                    "memory_mb {mem} outside [{MIN_RAM_MB}, {MAX_RAM_MB}]"
                )));
            }
        }
        if let Some(cpu) = self.cpu_count {
            if !(MIN_CPU_CORES..=MAX_CPU_CORES).contains(&cpu) {
                return Err(SkiffError::InvalidSpec(format!(
                    "cpu_count {cpu} outside [{MIN_CPU_CORES}, {MAX_CPU_CORES}]"
                )));
            }
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SkiffError::InvalidSpec("name must not be empty".into()));
    }
    if name.contains(['/', '\\']) || name.contains("..") {
        return Err(SkiffError::InvalidSpec(format!(
            "name '{name}' must not contain path separators"
        )));
    }
    Ok(())
}

/// A resource the orchestrator can be asked to provision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResourceSpec {
    Container(ContainerSpec),
    Vm(VmSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Container(_) => ResourceKind::Container,
            ResourceSpec::Vm(_) => ResourceKind::Vm,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ResourceSpec::Container(c) => &c.name,
            ResourceSpec::Vm(v) => &v.vm_name,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ResourceSpec::Container(c) => c.validate(),
            ResourceSpec::Vm(v) => v.validate(),
        }
    }
}

/// Read-only view of a registry entry, safe to hand to callers. Never backed
/// by a live backend call.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
    pub state: ResourceState,
    /// Backend-native reference (container id, VM pid + disk path).
    pub backend_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    /// True when the last confirmed observation of the backend is older than
    /// the configured staleness threshold.
    pub stale: bool,
    /// Human-readable detail for the last transition (e.g. failure message).
    pub detail: Option<String>,
}

/// Fires once when a provisioned resource's underlying process or container
/// exits. `None` is a clean exit; `Some(detail)` carries the failure.
pub type ExitNotice = tokio::sync::oneshot::Receiver<Option<String>>;

/// What a backend hands back for a successful provision.
#[derive(Debug)]
pub struct ProvisionOutcome {
    pub backend_ref: String,
    /// Absent when the backend cannot observe exits for this resource.
    pub exited: Option<ExitNotice>,
}

// Define the backend seam the orchestrator drives. Implementations must not
// hold locks across the whole provision; the orchestrator wraps every call
// in its own timeout.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Realize the spec. `id` is the orchestrator-assigned resource id;
    /// backends derive their native names from it.
    async fn provision(&self, id: &str, spec: &ResourceSpec) -> Result<ProvisionOutcome>;

    /// Stop a running resource.
    async fn stop(&self, id: &str) -> Result<()>;

    /// Liveness probe: `Ok(true)` when the resource is still up.
    async fn probe(&self, id: &str) -> Result<bool>;

    /// Best-effort cleanup after a cancelled or timed-out provision. Must not
    /// fail loudly; errors are logged by the implementation.
    async fn reap(&self, id: &str);
}
