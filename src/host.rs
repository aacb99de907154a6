//! Host introspection: a `HostCapacity` snapshot and the KVM precondition.

use std::path::Path;

use nix::sys::statvfs::statvfs;

use crate::capacity::HostCapacity;
use crate::config::HostConfig;
use crate::error::ProvisionError;

const MEMINFO: &str = "/proc/meminfo";
const MODULES: &str = "/proc/modules";

/// Capture the current host resources. Nothing is cached: every planning
/// call sees the host as it is now.
///
/// Cores are the CPUs this process may run on (`available_parallelism`),
/// so cgroup quotas and affinity masks lower the count below the number of
/// online CPUs.
pub fn capture(config: &HostConfig) -> Result<HostCapacity, ProvisionError> {
    let meminfo = std::fs::read_to_string(MEMINFO).map_err(|e| ProvisionError::Io {
        context: format!("reading {MEMINFO}"),
        source: e,
    })?;
    let total_memory_mb =
        parse_meminfo_available_mb(&meminfo).ok_or_else(|| ProvisionError::Host {
            message: format!("no MemAvailable entry in {MEMINFO}"),
        })?;

    let total_disk_gb = free_disk_gb(Path::new(&config.default_mount_point))?;

    let total_cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .map_err(|e| ProvisionError::Io {
            context: "querying CPU count".into(),
            source: e,
        })?;

    let capacity = HostCapacity {
        total_memory_mb,
        reserved_os_memory_mb: config.os_system_memory_mb,
        total_disk_gb,
        reserved_os_disk_percent: config.disk_space_allocated_to_os_percent,
        total_cores,
        reserved_os_cores: config.os_system_cores,
    };
    tracing::debug!(?capacity, "captured host capacity");
    Ok(capacity)
}

/// Fail unless a KVM module is loaded.
pub fn check_kvm() -> Result<(), ProvisionError> {
    let modules = std::fs::read_to_string(MODULES).map_err(|e| ProvisionError::Io {
        context: format!("reading {MODULES}"),
        source: e,
    })?;
    if modules_have_kvm(&modules) {
        Ok(())
    } else {
        Err(ProvisionError::Host {
            message: "KVM (vmx/svm) is disabled by your BIOS. Enter your BIOS setup, enable \
                      Virtualization Technology (VT), then power the system off and on"
                .into(),
        })
    }
}

/// `MemAvailable` in MiB (what `free -m` reports as "available").
pub fn parse_meminfo_available_mb(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib / 1024)
    })
}

pub fn modules_have_kvm(modules: &str) -> bool {
    modules
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|name| name == "kvm_intel" || name == "kvm_amd")
}

/// Free space available to unprivileged users under `mount_point`, in
/// decimal gigabytes.
fn free_disk_gb(mount_point: &Path) -> Result<u64, ProvisionError> {
    let stat = statvfs(mount_point).map_err(|errno| ProvisionError::Io {
        context: format!("statvfs {}", mount_point.display()),
        source: std::io::Error::from(errno),
    })?;

    let bytes = (stat.fragment_size() as u64).saturating_mul(stat.blocks_available() as u64);
    Ok(bytes / 1_000_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO_FIXTURE: &str = "\
MemTotal:       32718432 kB
MemFree:         1630396 kB
MemAvailable:   20971520 kB
Buffers:          933464 kB
";

    #[test]
    fn meminfo_available_in_mib() {
        assert_eq!(parse_meminfo_available_mb(MEMINFO_FIXTURE), Some(20480));
    }

    #[test]
    fn meminfo_without_available_is_none() {
        assert_eq!(parse_meminfo_available_mb("MemTotal: 1024 kB\n"), None);
    }

    #[test]
    fn kvm_module_detected() {
        let modules = "\
kvm_intel 479232 0 - Live 0x0000000000000000
kvm 1302528 1 kvm_intel, Live 0x0000000000000000
";
        assert!(modules_have_kvm(modules));
        assert!(modules_have_kvm("kvm_amd 1 0 - Live 0x0\n"));
    }

    #[test]
    fn bare_kvm_module_is_not_enough() {
        assert!(!modules_have_kvm("kvm 1302528 0 - Live 0x0\n"));
        assert!(!modules_have_kvm(""));
    }

    #[test]
    fn free_disk_of_root_is_readable() {
        free_disk_gb(Path::new("/")).unwrap();
    }

    #[test]
    fn free_disk_of_missing_path_fails() {
        match free_disk_gb(Path::new("/nonexistent/mount/point")).unwrap_err() {
            ProvisionError::Io { context, source } => {
                assert!(context.starts_with("statvfs /nonexistent"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
