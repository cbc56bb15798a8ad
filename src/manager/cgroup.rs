//! Per-job cgroup-v2 directories.
//!
//! Each job gets `⟨root⟩/⟨job_id⟩` with the cpu, memory and io controllers
//! delegated. The directory is opened with `O_PATH` and the descriptor kept
//! for the job's lifetime so the child can be attached to the cgroup at
//! spawn time.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::error::{JobWorkerError, Result};

/// Fixed period used for `cpu.max`; limits are quotas against this period.
const CPU_PERIOD_MICROS: i64 = 1_000_000;
/// Block-io limits apply to the device backing this mount point.
const IO_LIMIT_MOUNT_POINT: &str = "/";
const PROC_MOUNTS_PATH: &str = "/proc/self/mounts";
const CGROUP_DIR_MODE: u32 = 0o755;
const PROC_MOUNT_FIELDS: usize = 6;

/// Limits applied on creation. A zero or negative value leaves the
/// corresponding controller file untouched.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub cpu_max_quota_micros: i64,
    pub mem_max_bytes: i64,
    pub io_max_bytes_per_sec: i64,
}

#[derive(Debug)]
pub struct Cgroup {
    root: PathBuf,
    path: PathBuf,
    fd: Option<fs::File>,
}

impl Cgroup {
    pub fn new(root: impl Into<PathBuf>, name: &str) -> Self {
        let root = root.into();
        let path = root.join(name);
        Self {
            root,
            path,
            fd: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptor to the cgroup directory, valid between `create` and
    /// `delete`. Passed to the spawn path so the child lands in this cgroup.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|f| f.as_raw_fd())
    }

    /// Delegate controllers, create the directory, open the `O_PATH`
    /// descriptor and apply `limits`. On error, partial state is left in
    /// place for the caller to clean up via `delete`.
    pub fn create(&mut self, limits: &ResourceLimits) -> Result<()> {
        let control = self.root.join("cgroup.subtree_control");
        write_cgroup_file(&control, "+cpu +memory +io")?;

        if !self.path.exists() {
            fs::DirBuilder::new()
                .mode(CGROUP_DIR_MODE)
                .create(&self.path)
                .map_err(JobWorkerError::io(format!(
                    "creating cgroup directory {}",
                    self.path.display()
                )))?;
        }

        let fd = fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH)
            .open(&self.path)
            .map_err(JobWorkerError::io(format!(
                "opening cgroup directory {}",
                self.path.display()
            )))?;
        self.fd = Some(fd);

        self.set_limits(limits)
    }

    /// Close the descriptor and remove the directory. Idempotent: deleting
    /// a cgroup that is already gone is not an error.
    pub fn delete(&mut self) -> Result<()> {
        if let Some(fd) = self.fd.take() {
            tracing::debug!(path = %self.path.display(), "closing cgroup descriptor");
            drop(fd);
        }

        tracing::debug!(path = %self.path.display(), "removing cgroup directory");

        // rmdir works on a live cgroup even though the kernel populates it
        // with control files; only the recursive fallback is needed when the
        // path is a plain directory (tests over a temp root).
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(_) => match fs::remove_dir_all(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(JobWorkerError::io(format!(
                    "removing cgroup {}",
                    self.path.display()
                ))(e)),
            },
        }
    }

    fn set_limits(&self, limits: &ResourceLimits) -> Result<()> {
        if limits.cpu_max_quota_micros > 0 {
            self.set_cpu_limit(limits.cpu_max_quota_micros)?;
        }
        if limits.io_max_bytes_per_sec > 0 {
            self.set_io_limit(limits.io_max_bytes_per_sec)?;
        }
        if limits.mem_max_bytes > 0 {
            self.set_memory_limit(limits.mem_max_bytes)?;
        }
        Ok(())
    }

    fn set_cpu_limit(&self, quota_micros: i64) -> Result<()> {
        let value = format!("{quota_micros} {CPU_PERIOD_MICROS}");
        write_cgroup_file(&self.path.join("cpu.max"), &value)
    }

    fn set_memory_limit(&self, bytes: i64) -> Result<()> {
        write_cgroup_file(&self.path.join("memory.max"), &bytes.to_string())
    }

    /// Resolve the device backing `/`, then cap read and write bandwidth
    /// against its major number. Minor is fixed at 0 so the limit covers the
    /// whole disk regardless of partition layout.
    fn set_io_limit(&self, bytes_per_sec: i64) -> Result<()> {
        let device = device_for_mount(IO_LIMIT_MOUNT_POINT)?;

        let metadata = fs::metadata(&device)
            .map_err(JobWorkerError::io(format!("stat device node {device}")))?;
        let major = libc::major(metadata.rdev());

        tracing::debug!(device, major, "resolved io.max device");

        let value = format!("{major}:0 rbps={bytes_per_sec} wbps={bytes_per_sec}");
        write_cgroup_file(&self.path.join("io.max"), &value)
    }
}

fn write_cgroup_file(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(JobWorkerError::io(format!(
        "writing cgroup file {}",
        path.display()
    )))
}

fn device_for_mount(mountpoint: &str) -> Result<String> {
    let mounts = fs::read_to_string(PROC_MOUNTS_PATH)
        .map_err(JobWorkerError::io(format!("reading {PROC_MOUNTS_PATH}")))?;

    find_mount_device(&mounts, mountpoint)
        .map(str::to_owned)
        .ok_or_else(|| JobWorkerError::Io {
            context: format!("resolving device for mount {mountpoint}"),
            source: std::io::Error::new(
                ErrorKind::NotFound,
                format!("mountpoint {mountpoint} not listed in {PROC_MOUNTS_PATH}"),
            ),
        })
}

/// Scan mount-table records (`device mount fstype options dump passno`) for
/// the entry whose mount point matches, returning its device field.
fn find_mount_device<'a>(mounts: &'a str, mountpoint: &str) -> Option<&'a str> {
    mounts.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() == PROC_MOUNT_FIELDS && fields[1] == mountpoint {
            Some(fields[0])
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MOUNTS: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/nvme0n1p4 / btrfs rw,relatime,compress=zstd:1,ssd 0 0
/dev/nvme0n1p1 /boot ext4 rw,relatime 0 0
tmpfs /tmp tmpfs rw,nosuid,nodev 0 0
";

    #[test]
    fn find_mount_device_matches_root() {
        assert_eq!(find_mount_device(SAMPLE_MOUNTS, "/"), Some("/dev/nvme0n1p4"));
    }

    #[test]
    fn find_mount_device_matches_exact_mountpoint_only() {
        assert_eq!(
            find_mount_device(SAMPLE_MOUNTS, "/boot"),
            Some("/dev/nvme0n1p1")
        );
        assert_eq!(find_mount_device(SAMPLE_MOUNTS, "/bo"), None);
    }

    #[test]
    fn find_mount_device_skips_malformed_records() {
        let mounts = "garbage line\n/dev/sda1 / ext4 rw 0 0\n";
        assert_eq!(find_mount_device(mounts, "/"), Some("/dev/sda1"));
    }

    #[test]
    fn find_mount_device_missing_mountpoint() {
        assert_eq!(find_mount_device(SAMPLE_MOUNTS, "/var/data"), None);
    }
}
