//! # Node Launcher
//!
//! Boots the service roles of one machine as isolated node processes.
//!
//! The requested role set is expanded with every role it depends on and
//! spawned dependency-first. A role is only spawned once the roles it depends
//! on have signalled readiness, so a failing dependency stops the launch
//! before anything that needs it starts. Once every node is ready the
//! launcher idles until Ctrl-C or until a node exits on its own, then
//! finalizes the rest.
//!
//! - [`supervisor`]: launch ordering, readiness waits and idempotent shutdown
//! - [`process`]: spawning node processes and their control channel
//! - [`error`]: launch failures

pub mod error;
pub mod process;
pub mod supervisor;

pub use error::LaunchError;
pub use process::{ChildProcessSpawner, NodeProcess, NodeSpawner, Readiness, SpawnRequest};
pub use supervisor::{NodeProcessSupervisor, SupervisorSettings};
