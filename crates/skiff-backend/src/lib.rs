//! Backends that realize skiff resources: a container-engine client built on
//! bollard and a QEMU process supervisor. Both implement the
//! [`skiff_common::ResourceBackend`] seam the orchestrator drives.

// Re-export dependencies potentially needed by consumers (like the binary)
pub use bollard;
pub use skiff_common as common;

pub mod docker;
pub mod qemu;
pub mod test_utils;

pub use docker::DockerBackend;
pub use qemu::{QemuBackend, QemuConfig};
