//! Process supervisor for the pubwatch pipeline.
//!
//! Runs `pubwatch run` as a child, checks it on an interval (process
//! liveness plus heartbeat freshness), restarts it with exponential backoff,
//! and gives up after too many consecutive crashes. A second interval looks
//! for new commits on a git remote, applies them, and rolls back when the
//! updated pipeline does not come up healthy.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod git;
pub mod process;
pub mod state;
pub mod supervisor;

pub use error::{Result, SupervisionError};
pub use git::{GitRemote, SourceControl};
pub use process::{ChildProcess, ProcessHandle};
pub use state::{Phase, SupervisorState};
pub use supervisor::{AlertSink, Exit, Supervisor, Timings};
