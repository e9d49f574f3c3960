//! Process lifecycle for running jobs.
//!
//! - [`ProcessSupervisor`]: spawns `sh -c <command>` attached to the job's
//!   cgroup and output file, and owns one waiter task per child
//! - [`Reaper`]: consumes exit events, records the terminal status, and
//!   deletes the job's cgroup
//!
//! # Stop escalation
//!
//! A stop request makes the child's waiter send SIGTERM to the job's process
//! group, then SIGKILL once the grace period runs out. The job's status only
//! changes when the reaper sees the exit.

pub mod reaper;
pub mod supervisor;

pub use reaper::Reaper;
pub use supervisor::{ExitEvent, ProcessSupervisor, SpawnError, SpawnRequest, SpawnedProcess};
