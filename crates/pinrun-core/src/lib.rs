//! Run a callable from a pinned repository revision under a chosen isolation level.
//!
//! A task names a `module:object` callable plus its arguments. The runner
//! checks out the requested branch, works out the repository's requirements,
//! and executes the task through one of several backends, returning the
//! callable's output together with what it printed.
//!
//! # Architecture Overview
//!
//! - **Snapshots**: commit-pinned working copies, refreshed per call or pinned for a session
//! - **Requirements**: content-hashed dependency declarations that decide environment and image reuse
//! - **Backends**: the caller's interpreter, isolated environments, containers, or containers inside VMs
//! - **Result cache**: fingerprinted results in a pluggable key-value store, self-tested on startup
//! - **Task runner**: the orchestrator tying the above together, plus static file lookup
//! - **Configuration**: YAML settings with `PINRUN_*` environment overrides

pub mod backend;
pub mod cache;
pub mod config;
pub mod errors;
pub mod keyed_lock;
pub mod process;
pub mod requirements;
pub mod runner;
pub mod snapshot;
pub mod task;
pub mod task_runner;

pub use backend::{Backend, ExecutionContext};
pub use cache::{CacheStore, ResultCache};
pub use config::*;
pub use errors::{ErrorKind, PinrunError, Result};
pub use requirements::{RequirementsSet, RequirementsStrategy};
pub use snapshot::{PullOptions, RepoRef, Snapshot, SnapshotManager};
pub use task::{Task, TaskResult};
pub use task_runner::TaskRunner;
