//! Job records and the registry that owns them.
//!
//! Every status change goes through [`JobRegistry::apply`], which enforces
//! the forward-only lifecycle:
//!
//! ```text
//! Pending ──> Running ──> Stopped
//!    │           └──────> Error
//!    └──────────────────> Error
//! ```

pub mod job;
pub mod registry;

pub use job::{ErrorDetail, ExitOutcome, Job, JobStatus, EXIT_CODE_UNSET};
pub use registry::{JobRegistry, Transition, TransitionError};
