//! # auto-tmpdir-core
//!
//! Per-job private temporary directories for a multi-tenant batch cluster.
//!
//! This crate provides:
//! - Deterministic path composition for a job/step/task identity with an
//!   ordered base fallback (override, shared storage, local default)
//! - Scoped impersonation of the job's owner for every filesystem change
//! - Component-wise directory creation that refuses non-directory collisions
//! - Ownership-checked, symlink-safe, single-filesystem tree removal
//! - Optional bind-mount isolation inside a private mount namespace
//! - A lifecycle coordinator with an explicit cleanup-owner policy

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod builder;
pub mod config;
pub mod error;
pub mod identity;
pub mod isolation;
pub mod lifecycle;
pub mod path;
pub mod privilege;
pub mod remover;

pub use config::{IsolationConfig, TmpdirConfig};
pub use error::TmpdirError;
pub use identity::{Credentials, HostRole, JobContext, JobIdentity, JobStep, StepContext};
pub use lifecycle::{CleanupPolicy, LifecycleState, TmpdirLifecycle, export, provision, teardown};
pub use path::{BaseSource, PathResolver, ResolvedPath};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, TmpdirError>;
