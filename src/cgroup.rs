//! cgroup v2 resource control, one group per job.
//!
//! Limits are applied by writing the group's control files directly:
//! `cpu.max`, `memory.max`, `io.max` (one line per block device) and
//! `pids.max`. Processes join a group either between fork and exec (see
//! [`SpawnAttachment`]) or afterwards through [`ResourceLimiter::attach`].

use std::fs;
use std::io::{self, ErrorKind};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

use crate::config::{ResourceLimits, WorkerConfig};

const CONTROLLERS: &str = "+cpu +memory +io +pids";
const RAM_DISK_MAJOR: u32 = 1;
const LOOP_MAJOR: u32 = 7;
const REMOVE_ATTEMPTS: u32 = 10;
const DRAIN_ATTEMPTS: u32 = 25;
const REMOVE_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("failed to create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },

    #[error("invalid device number {value:?} in {path}")]
    BadDevice { path: PathBuf, value: String },
}

/// An open handle on a group's `cgroup.procs`, written from the child between
/// fork and exec. Writing `0` moves the writing process into the group.
#[derive(Debug)]
pub struct SpawnAttachment {
    procs: OwnedFd,
}

impl SpawnAttachment {
    pub fn new(procs: OwnedFd) -> Self {
        Self { procs }
    }

    pub fn into_fd(self) -> OwnedFd {
        self.procs
    }
}

/// Resource-control capability used by the job manager and the reaper.
///
/// The real implementation is [`CgroupController`]; tests substitute fakes.
pub trait ResourceLimiter: Send + Sync + std::fmt::Debug {
    /// Where the group for `id` lives.
    fn group_path(&self, id: &Uuid) -> PathBuf;

    /// Create the job's group and return its path.
    fn create_group(&self, id: &Uuid) -> Result<PathBuf, CgroupError>;

    /// Write the fixed limits into the job's group.
    fn apply_limits(&self, id: &Uuid) -> Result<(), CgroupError>;

    /// Handle for joining the group at spawn time. `None` when the limiter
    /// has nothing to attach.
    fn spawn_attachment(&self, id: &Uuid) -> Result<Option<SpawnAttachment>, CgroupError>;

    /// Move an already running process into the job's group.
    fn attach(&self, id: &Uuid, pid: u32) -> Result<(), CgroupError>;

    /// Whether the kernel OOM-killed anything in the group.
    fn oom_killed(&self, _id: &Uuid) -> bool {
        false
    }

    /// Kill every process still in the job's group and wait briefly for the
    /// group to empty.
    fn kill_members(&self, _id: &Uuid) -> Result<(), CgroupError> {
        Ok(())
    }

    /// Remove the job's group. Absent groups are not an error.
    fn destroy_group(&self, id: &Uuid) -> Result<(), CgroupError>;
}

/// Direct-write cgroup v2 implementation rooted at `WorkerConfig::cgroup_root`.
#[derive(Debug, Clone)]
pub struct CgroupController {
    root: PathBuf,
    block_devices_dir: PathBuf,
    limits: ResourceLimits,
}

impl CgroupController {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            root: config.cgroup_root.clone(),
            block_devices_dir: config.block_devices_dir.clone(),
            limits: config.limits,
        }
    }

    /// Create the root group and delegate controllers to it and to its
    /// children. Needs root on a real host.
    pub fn init(config: &WorkerConfig) -> Result<Self, CgroupError> {
        let controller = Self::new(config);
        fs::create_dir_all(&controller.root).map_err(|source| CgroupError::Create {
            path: controller.root.clone(),
            source,
        })?;

        if let Some(parent) = controller.root.parent() {
            write_control(&parent.join("cgroup.subtree_control"), CONTROLLERS)?;
        }
        write_control(&controller.root.join("cgroup.subtree_control"), CONTROLLERS)?;

        tracing::info!(root = %controller.root.display(), "Cgroup root ready");
        Ok(controller)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `MAJ:MIN` of every whole block device worth throttling.
    pub fn block_devices(&self) -> Result<Vec<(u32, u32)>, CgroupError> {
        let entries = match fs::read_dir(&self.block_devices_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(
                    dir = %self.block_devices_dir.display(),
                    "Block device directory missing, io.max not applied"
                );
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(CgroupError::Read {
                    path: self.block_devices_dir.clone(),
                    source,
                })
            }
        };

        let mut names: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        names.sort();

        let mut devices = Vec::new();
        for dev_dir in names {
            let dev_file = dev_dir.join("dev");
            let raw = match fs::read_to_string(&dev_file) {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(CgroupError::Read {
                        path: dev_file,
                        source,
                    })
                }
            };
            let (major, minor) = parse_dev(raw.trim()).ok_or_else(|| CgroupError::BadDevice {
                path: dev_file.clone(),
                value: raw.trim().to_string(),
            })?;
            if major == RAM_DISK_MAJOR || major == LOOP_MAJOR {
                continue;
            }
            devices.push((major, minor));
        }
        Ok(devices)
    }
}

impl ResourceLimiter for CgroupController {
    fn group_path(&self, id: &Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn create_group(&self, id: &Uuid) -> Result<PathBuf, CgroupError> {
        let path = self.group_path(id);
        fs::create_dir(&path).map_err(|source| CgroupError::Create {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(job_id = %id, path = %path.display(), "Cgroup created");
        Ok(path)
    }

    fn apply_limits(&self, id: &Uuid) -> Result<(), CgroupError> {
        let path = self.group_path(id);
        let limits = &self.limits;

        write_control(
            &path.join("cpu.max"),
            &format!("{} {}", limits.cpu_quota_us, limits.cpu_period_us),
        )?;
        write_control(&path.join("memory.max"), &limits.memory_max_bytes.to_string())?;
        for (major, minor) in self.block_devices()? {
            write_control(
                &path.join("io.max"),
                &format!(
                    "{}:{} rbps={} wbps={}",
                    major, minor, limits.io_bytes_per_sec, limits.io_bytes_per_sec
                ),
            )?;
        }
        write_control(&path.join("pids.max"), &limits.pids_max.to_string())?;

        tracing::debug!(
            job_id = %id,
            cpu_quota_us = limits.cpu_quota_us,
            memory_max = limits.memory_max_bytes,
            io_bps = limits.io_bytes_per_sec,
            pids_max = limits.pids_max,
            "Cgroup limits applied"
        );
        Ok(())
    }

    fn spawn_attachment(&self, id: &Uuid) -> Result<Option<SpawnAttachment>, CgroupError> {
        let procs = self.group_path(id).join("cgroup.procs");
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&procs)
            .map_err(|source| CgroupError::Write {
                path: procs.clone(),
                source,
            })?;
        Ok(Some(SpawnAttachment::new(OwnedFd::from(file))))
    }

    fn attach(&self, id: &Uuid, pid: u32) -> Result<(), CgroupError> {
        write_control(&self.group_path(id).join("cgroup.procs"), &pid.to_string())?;
        tracing::debug!(job_id = %id, pid, "Process attached to cgroup");
        Ok(())
    }

    fn oom_killed(&self, id: &Uuid) -> bool {
        let events = self.group_path(id).join("memory.events");
        match fs::read_to_string(&events) {
            Ok(content) => parse_oom_kills(&content) > 0,
            Err(_) => false,
        }
    }

    fn kill_members(&self, id: &Uuid) -> Result<(), CgroupError> {
        let path = self.group_path(id);
        let kill = path.join("cgroup.kill");
        if !kill.exists() {
            return Ok(());
        }
        write_control(&kill, "1")?;

        let events = path.join("cgroup.events");
        for _ in 0..DRAIN_ATTEMPTS {
            match fs::read_to_string(&events) {
                Ok(content) if is_populated(&content) => std::thread::sleep(REMOVE_BACKOFF),
                _ => return Ok(()),
            }
        }
        tracing::warn!(job_id = %id, "Cgroup still populated after cgroup.kill");
        Ok(())
    }

    fn destroy_group(&self, id: &Uuid) -> Result<(), CgroupError> {
        let path = self.group_path(id);
        if !path.exists() {
            return Ok(());
        }

        if let Err(e) = self.kill_members(id) {
            tracing::warn!(job_id = %id, error = %e, "Failed to kill remaining cgroup members");
        }

        let mut attempt = 0;
        loop {
            match fs::remove_dir(&path) {
                Ok(()) => {
                    tracing::debug!(job_id = %id, "Cgroup removed");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) if e.raw_os_error() == Some(nix::libc::EBUSY) && attempt < REMOVE_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(REMOVE_BACKOFF);
                }
                Err(source) => return Err(CgroupError::Remove { path, source }),
            }
        }
    }
}

fn write_control(path: &Path, content: &str) -> Result<(), CgroupError> {
    fs::write(path, content).map_err(|source| CgroupError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_dev(raw: &str) -> Option<(u32, u32)> {
    let (major, minor) = raw.split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn is_populated(cgroup_events: &str) -> bool {
    cgroup_events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .any(|(key, value)| key == "populated" && value.trim() != "0")
}

fn parse_oom_kills(memory_events: &str) -> u64 {
    memory_events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
