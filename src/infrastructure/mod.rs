//! Infrastructure Layer
//!
//! Process lifecycle: shutdown coordination and periodic jobs.

pub mod job_runner;
pub mod shutdown;

pub use job_runner::{JobConfig, JobRunner};
pub use shutdown::{shutdown_signal, JobGuard, ShutdownController};
