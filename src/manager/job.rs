//! Job lifecycle: an atomic status word driven through
//! `Init → Scheduled → {FailedToStart | Running → Stopped}` by
//! compare-and-swap, a child process launched into fresh namespaces and a
//! per-job cgroup, and a monitor task that reaps the child and tears
//! everything down.

use std::ffi::CStr;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setpgid, Pid};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cgroup::{Cgroup, ResourceLimits};
use crate::error::{JobWorkerError, Result};

const CGROUP_SYSFS_ROOT: &str = "/sys/fs/cgroup";
const LOG_DIR: &str = "/tmp/jobworker";
const LOG_DIR_MODE: u32 = 0o755;

const DEFAULT_CPU_MAX_QUOTA_MICROS: i64 = 500_000;
const DEFAULT_MEM_MAX_BYTES: i64 = 500_000;
const DEFAULT_IO_MAX_BPS: i64 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JobStatus {
    Init = 0,
    Scheduled = 1,
    FailedToStart = 2,
    Running = 3,
    Stopped = 4,
}

impl JobStatus {
    fn from_raw(raw: i32) -> Self {
        match raw {
            0 => JobStatus::Init,
            1 => JobStatus::Scheduled,
            2 => JobStatus::FailedToStart,
            3 => JobStatus::Running,
            4 => JobStatus::Stopped,
            // The atomic only ever holds values stored from this enum.
            _ => unreachable!("invalid job status word: {raw}"),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Init => "Init",
            JobStatus::Scheduled => "Scheduled",
            JobStatus::FailedToStart => "FailedToStart",
            JobStatus::Running => "Running",
            JobStatus::Stopped => "Stopped",
        };
        write!(f, "{name}")
    }
}

/// Shared, lock-free view of a job. Everything mutable is atomic; the rest
/// is immutable after construction.
pub struct JobInfo {
    job_id: String,
    command: String,
    args: Vec<String>,
    pid: AtomicI32,
    exit_code: AtomicI32,
    status: AtomicI32,
}

impl JobInfo {
    fn new(job_id: String, command: String, args: Vec<String>) -> Self {
        Self {
            job_id,
            command,
            args,
            pid: AtomicI32::new(0),
            exit_code: AtomicI32::new(0),
            status: AtomicI32::new(JobStatus::Init as i32),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_raw(self.status.load(Ordering::SeqCst))
    }

    /// A job is active while it is being prepared or its child is alive.
    pub fn is_active(&self) -> bool {
        matches!(self.status(), JobStatus::Scheduled | JobStatus::Running)
    }

    fn transition(&self, from: JobStatus, to: JobStatus) -> bool {
        self.status
            .compare_exchange(from as i32, to as i32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Launch knobs. The defaults confine the child (fresh mount, pid and
/// network namespaces plus a cgroup under the system root); `unconfined`
/// drops all of that so tests can run without privileges.
pub struct JobOptions {
    pub clone_flags: CloneFlags,
    pub cgroup_root: Option<PathBuf>,
    /// Overrides the generated id. Test hook only.
    pub job_id: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            clone_flags: CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWNET,
            cgroup_root: Some(PathBuf::from(CGROUP_SYSFS_ROOT)),
            job_id: None,
        }
    }
}

impl JobOptions {
    pub fn unconfined() -> Self {
        Self {
            clone_flags: CloneFlags::empty(),
            cgroup_root: None,
            job_id: None,
        }
    }
}

pub struct Job {
    info: Arc<JobInfo>,
    log_file: Mutex<Option<std::fs::File>>,
    cancel: OnceLock<CancellationToken>,
    clone_flags: CloneFlags,
    cgroup: Mutex<Option<Cgroup>>,
}

impl Job {
    pub fn new(command: String, args: Vec<String>, opts: JobOptions) -> Self {
        let job_id = opts.job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let cgroup = opts
            .cgroup_root
            .map(|root| Cgroup::new(root, &job_id));

        Self {
            info: Arc::new(JobInfo::new(job_id, command, args)),
            log_file: Mutex::new(None),
            cancel: OnceLock::new(),
            clone_flags: opts.clone_flags,
            cgroup: Mutex::new(cgroup),
        }
    }

    pub fn info(&self) -> Arc<JobInfo> {
        self.info.clone()
    }

    pub fn log_path(&self) -> PathBuf {
        Path::new(LOG_DIR).join(format!("{}.log", self.info.job_id()))
    }

    /// Prepare the cgroup and log file, spawn the child and hand it to the
    /// monitor task. Any preparation or spawn failure lands the job in
    /// `FailedToStart` with partial resources cleaned up.
    pub(crate) async fn start(self: Arc<Self>, shutdown: &CancellationToken) -> Result<()> {
        let job_id = self.info.job_id().to_string();

        // Guards against double-start: only one caller wins this swap.
        if !self.info.transition(JobStatus::Init, JobStatus::Scheduled) {
            return Err(JobWorkerError::InvalidState(job_id));
        }

        if let Err(e) = self.prepare_cgroup().await {
            self.fail_start(&job_id).await;
            return Err(JobWorkerError::PreparationFailed {
                job_id,
                reason: format!("initializing cgroup: {e}"),
            });
        }

        let log_file = match self.open_log_file().await {
            Ok(file) => file,
            Err(e) => {
                self.fail_start(&job_id).await;
                return Err(JobWorkerError::PreparationFailed {
                    job_id,
                    reason: format!("opening log file: {e}"),
                });
            }
        };

        tracing::info!(
            %job_id,
            command = self.info.command(),
            args = ?self.info.args(),
            "executing job"
        );

        let child = match self.spawn_child(&log_file).await {
            Ok(child) => child,
            Err(e) => {
                self.fail_start(&job_id).await;
                return Err(JobWorkerError::PreparationFailed {
                    job_id,
                    reason: format!("spawning {}: {e}", self.info.command()),
                });
            }
        };
        *self.log_file.lock().await = Some(log_file);

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        tracing::info!(%job_id, pid, "job running");

        self.info.pid.store(pid, Ordering::SeqCst);
        self.info
            .status
            .store(JobStatus::Running as i32, Ordering::SeqCst);

        // Stop requests cancel this token; the monitor translates that into
        // a kill and drives the terminal transition either way.
        let cancel = shutdown.child_token();
        let _ = self.cancel.set(cancel.clone());

        tokio::spawn(self.clone().monitor(child, cancel));

        Ok(())
    }

    async fn prepare_cgroup(&self) -> Result<()> {
        let mut guard = self.cgroup.lock().await;
        let Some(cgroup) = guard.as_mut() else {
            return Ok(());
        };

        let limits = ResourceLimits {
            cpu_max_quota_micros: DEFAULT_CPU_MAX_QUOTA_MICROS,
            mem_max_bytes: DEFAULT_MEM_MAX_BYTES,
            io_max_bytes_per_sec: DEFAULT_IO_MAX_BPS,
        };

        tracing::debug!(
            job_id = self.info.job_id(),
            path = %cgroup.path().display(),
            ?limits,
            "initializing cgroup"
        );

        cgroup.create(&limits)
    }

    async fn open_log_file(&self) -> std::io::Result<std::fs::File> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(LOG_DIR_MODE)
            .create(LOG_DIR)?;

        std::fs::File::create(self.log_path())
    }

    async fn spawn_child(&self, log_file: &std::fs::File) -> std::io::Result<Child> {
        let stdout = log_file.try_clone()?;
        let stderr = log_file.try_clone()?;

        let mut cmd = Command::new(self.info.command());
        cmd.args(self.info.args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let clone_flags = self.clone_flags;
        let cgroup_fd = self.cgroup.lock().await.as_ref().and_then(|c| c.raw_fd());

        // Runs in the forked child before exec: make it a process-group
        // leader, attach it to the job's cgroup through the O_PATH anchor
        // descriptor, then enter the requested namespaces.
        unsafe {
            cmd.pre_exec(move || {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

                if let Some(dir_fd) = cgroup_fd {
                    attach_self_to_cgroup(dir_fd)?;
                }

                if !clone_flags.is_empty() {
                    nix::sched::unshare(clone_flags)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

                    // unshare(2) applies mount and net immediately but never
                    // moves the caller into a new pid namespace; only its
                    // future children are born there. An extra fork is
                    // needed so the exec'd job actually gets pid isolation.
                    if clone_flags.contains(CloneFlags::CLONE_NEWPID) {
                        enter_pid_namespace()?;
                    }
                }

                Ok(())
            });
        }

        cmd.spawn()
    }

    /// Wait for the child, record whatever exit code the OS reports and
    /// drive `Running → Stopped`. Cleanup errors are logged, not propagated;
    /// the job is terminal regardless.
    async fn monitor(self: Arc<Self>, mut child: Child, cancel: CancellationToken) {
        let job_id = self.info.job_id().to_string();

        let wait_result = tokio::select! {
            result = child.wait() => result,
            _ = cancel.cancelled() => {
                tracing::info!(%job_id, "stop requested, killing process group");
                self.kill_process_group();
                child.wait().await
            }
        };

        let exit_code = match wait_result {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                tracing::error!(%job_id, error = %e, "waiting on child failed");
                -1
            }
        };
        self.info.exit_code.store(exit_code, Ordering::SeqCst);

        tracing::info!(%job_id, exit_code, "job exited");

        if let Err(e) = self.stop(JobStatus::Running, JobStatus::Stopped).await {
            tracing::warn!(%job_id, error = %e, "cleanup after exit");
        }
    }

    fn kill_process_group(&self) {
        let pid = self.info.pid();
        if pid <= 0 {
            return;
        }
        // Negative pid signals the whole group; ESRCH just means the child
        // beat us to the exit.
        if let Err(e) = kill(Pid::from_raw(-pid), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                tracing::warn!(job_id = self.info.job_id(), error = %e, "kill failed");
            }
        }
    }

    /// Terminal transition. A losing swap returns immediately with no side
    /// effects; the winner closes the log file (raising `IN_CLOSE_WRITE`
    /// for subscribers) and deletes the cgroup, completing every step even
    /// if an earlier one fails.
    async fn stop(&self, from: JobStatus, to: JobStatus) -> Result<()> {
        if !self.info.transition(from, to) {
            return Err(JobWorkerError::InvalidState(self.info.job_id().to_string()));
        }

        if let Some(file) = self.log_file.lock().await.take() {
            drop(file);
        }

        if let Some(mut cgroup) = self.cgroup.lock().await.take() {
            cgroup.delete()?;
        }

        Ok(())
    }

    async fn fail_start(&self, job_id: &str) {
        if let Err(e) = self.stop(JobStatus::Scheduled, JobStatus::FailedToStart).await {
            tracing::warn!(job_id, error = %e, "cleanup after failed start");
        }
    }

    /// Request termination. Idempotent; a job that never started or has
    /// already stopped is unaffected.
    pub fn cancel(&self) {
        if let Some(token) = self.cancel.get() {
            tracing::info!(job_id = self.info.job_id(), "cancelling job");
            token.cancel();
        }
    }
}

/// Fork once more after `unshare(CLONE_NEWPID)` so the job runs as pid 1
/// of the fresh namespace. The forked child returns and goes on to exec;
/// the calling process stays behind as a shim that reaps the job and
/// mirrors how it ended (exit code, or death by the same signal). The shim
/// shares the job's process group and cgroup, so group kills and limits
/// cover both. Runs post-fork, so only raw syscalls are used.
fn enter_pid_namespace() -> std::io::Result<()> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if pid == 0 {
        // In the new pid namespace: continue to exec the job.
        return Ok(());
    }

    let mut status: libc::c_int = 0;
    loop {
        let reaped = unsafe { libc::waitpid(pid, &mut status, 0) };
        if reaped >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            unsafe { libc::_exit(127) };
        }
    }

    if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
            libc::_exit(128 + sig);
        }
    }

    unsafe { libc::_exit(libc::WEXITSTATUS(status)) }
}

/// Write `"0\n"` to `cgroup.procs` through the job's directory descriptor,
/// moving the calling process into the cgroup. Runs post-fork, so only raw
/// syscalls are used.
fn attach_self_to_cgroup(dir_fd: RawFd) -> std::io::Result<()> {
    const CGROUP_PROCS: &CStr = c"cgroup.procs";

    let fd = unsafe {
        libc::openat(
            dir_fd,
            CGROUP_PROCS.as_ptr(),
            libc::O_WRONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    // "0" attaches the writing process itself.
    let wrote = unsafe { libc::write(fd, b"0\n".as_ptr().cast(), 2) };
    let write_err = std::io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if wrote < 0 {
        return Err(write_err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> Job {
        Job::new("true".to_string(), Vec::new(), JobOptions::unconfined())
    }

    #[test]
    fn transitions_follow_the_lifecycle_path() {
        let job = test_job();
        let info = job.info();

        assert_eq!(info.status(), JobStatus::Init);
        assert!(!info.is_active());

        assert!(info.transition(JobStatus::Init, JobStatus::Scheduled));
        assert!(info.is_active());

        // Double-start loses the swap.
        assert!(!info.transition(JobStatus::Init, JobStatus::Scheduled));

        assert!(info.transition(JobStatus::Scheduled, JobStatus::Running));
        assert!(info.is_active());

        assert!(info.transition(JobStatus::Running, JobStatus::Stopped));
        assert!(!info.is_active());

        // Terminal: no back-edges.
        assert!(!info.transition(JobStatus::Stopped, JobStatus::Running));
    }

    #[test]
    fn failed_start_is_terminal() {
        let job = test_job();
        let info = job.info();

        assert!(info.transition(JobStatus::Init, JobStatus::Scheduled));
        assert!(info.transition(JobStatus::Scheduled, JobStatus::FailedToStart));
        assert!(!info.transition(JobStatus::FailedToStart, JobStatus::Running));
        assert!(!info.is_active());
    }

    #[test]
    fn status_display_names() {
        assert_eq!(JobStatus::Init.to_string(), "Init");
        assert_eq!(JobStatus::FailedToStart.to_string(), "FailedToStart");
        assert_eq!(JobStatus::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn log_path_is_derived_from_the_job_id() {
        let job = test_job();
        let expected = format!("/tmp/jobworker/{}.log", job.info().job_id());
        assert_eq!(job.log_path(), PathBuf::from(expected));
    }

    #[test]
    fn unconfined_jobs_have_no_cgroup_and_no_namespaces() {
        let opts = JobOptions::unconfined();
        assert!(opts.clone_flags.is_empty());
        assert!(opts.cgroup_root.is_none());
    }

    #[test]
    fn cancel_before_start_is_a_noop() {
        let job = test_job();
        job.cancel();
        assert_eq!(job.info().status(), JobStatus::Init);
    }
}
