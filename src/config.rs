use std::path::PathBuf;
use std::time::Duration;

/// Fixed per-job resource ceilings written into each job's cgroup.
///
/// These are not user-configurable at job start; every job gets the same
/// limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU quota in microseconds per period (`cpu.max` first field)
    pub cpu_quota_us: u64,
    /// CPU period in microseconds (`cpu.max` second field)
    pub cpu_period_us: u64,
    /// Memory ceiling in bytes (`memory.max`)
    pub memory_max_bytes: u64,
    /// Read and write throughput per block device in bytes/s (`io.max`)
    pub io_bytes_per_sec: u64,
    /// Maximum number of tasks in the group (`pids.max`)
    pub pids_max: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            // quota == period: one logical core
            cpu_quota_us: 100_000,
            cpu_period_us: 100_000,
            memory_max_bytes: 1024 * 1024 * 1024,
            io_bytes_per_sec: 10 * 1024 * 1024,
            pids_max: 256,
        }
    }
}

/// How a spawned process is placed into its cgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachMode {
    /// The child joins its cgroup between fork and exec, so the command never
    /// runs unconstrained.
    #[default]
    AtSpawn,
    /// The parent writes the child's pid into `cgroup.procs` after spawn.
    AfterSpawn,
}

/// Unprivileged identity job processes run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root control group under which one group per job is created
    pub cgroup_root: PathBuf,
    /// Directory listing block devices (`<dev>/dev` holds `MAJ:MIN`)
    pub block_devices_dir: PathBuf,
    /// Directory holding one output file per job
    pub output_dir: PathBuf,
    /// How often output readers poll for appended bytes
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL when stopping a job
    pub stop_grace_period: Duration,
    pub attach_mode: AttachMode,
    /// Drop job processes to this identity; `None` keeps the service identity
    pub run_as: Option<RunAs>,
    /// Delete output files this long after the job terminates; `None` keeps them
    pub output_retention: Option<Duration>,
    pub limits: ResourceLimits,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup/rpsmanager"),
            block_devices_dir: PathBuf::from("/sys/block"),
            output_dir: PathBuf::from("/var/lib/rpsmanager/output"),
            poll_interval: Duration::from_millis(200),
            stop_grace_period: Duration::from_secs(10),
            attach_mode: AttachMode::default(),
            run_as: None,
            output_retention: None,
            limits: ResourceLimits::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(cgroup_root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_block_devices_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.block_devices_dir = dir.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn with_attach_mode(mut self, mode: AttachMode) -> Self {
        self.attach_mode = mode;
        self
    }

    pub fn with_run_as(mut self, run_as: RunAs) -> Self {
        self.run_as = Some(run_as);
        self
    }

    pub fn with_output_retention(mut self, retention: Duration) -> Self {
        self.output_retention = Some(retention);
        self
    }
}
