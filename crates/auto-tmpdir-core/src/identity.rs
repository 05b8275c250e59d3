//! Job, step and task identity

use nix::unistd::{Gid, Uid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw step id the scheduler uses for the batch script context.
pub const BATCH_STEP_ID: u32 = 0xffff_fffb;

/// Raw step id the scheduler uses for the extern (setup) context.
pub const EXTERN_STEP_ID: u32 = 0xffff_fffc;

/// The two job-wide step contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStep {
    /// The job's batch script
    Batch,
    /// The always-present extern container
    Extern,
}

/// Which step of a job an invocation belongs to.
///
/// Job-wide contexts never get a step subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepContext {
    /// An ordinary parallel step
    Parallel(u32),
    /// The batch or extern context
    Job(JobStep),
}

impl StepContext {
    /// Map a raw scheduler step id, recognising the reserved sentinels.
    #[must_use]
    pub const fn from_raw(step_id: u32) -> Self {
        match step_id {
            BATCH_STEP_ID => Self::Job(JobStep::Batch),
            EXTERN_STEP_ID => Self::Job(JobStep::Extern),
            id => Self::Parallel(id),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Parallel(id) => id,
            Self::Job(JobStep::Batch) => BATCH_STEP_ID,
            Self::Job(JobStep::Extern) => EXTERN_STEP_ID,
        }
    }

    #[must_use]
    pub const fn is_job_wide(self) -> bool {
        matches!(self, Self::Job(_))
    }
}

impl fmt::Display for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallel(id) => write!(f, "{id}"),
            Self::Job(JobStep::Batch) => f.write_str("batch"),
            Self::Job(JobStep::Extern) => f.write_str("extern"),
        }
    }
}

/// The `(job, step, task)` tuple addressing one directory instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    pub job_id: u32,
    pub step: StepContext,
    pub task_id: u32,
}

impl JobIdentity {
    #[must_use]
    pub const fn new(job_id: u32, step: StepContext, task_id: u32) -> Self {
        Self {
            job_id,
            step,
            task_id,
        }
    }

    /// Build from raw scheduler ids.
    #[must_use]
    pub const fn from_raw(job_id: u32, step_id: u32, task_id: u32) -> Self {
        Self::new(job_id, StepContext::from_raw(step_id), task_id)
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.job_id, self.step, self.task_id)
    }
}

/// The (uid, gid) a job runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
}

impl Credentials {
    #[must_use]
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
        }
    }

    /// Effective credentials of the calling process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::geteuid(),
            gid: nix::unistd::getegid(),
        }
    }
}

/// What the host is doing when it calls into the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRole {
    /// Setting up the job environment before the payload runs
    PrepareEnvironment,
    /// Running privileged cleanup after the payload finished
    PrivilegedCleanup,
}

/// Everything the host hands over for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
    pub identity: JobIdentity,
    pub owner: Credentials,
    pub role: HostRole,
}

impl JobContext {
    #[must_use]
    pub const fn new(identity: JobIdentity, owner: Credentials, role: HostRole) -> Self {
        Self {
            identity,
            owner,
            role,
        }
    }
}
