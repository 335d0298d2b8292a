//! Process role.

use clap::ValueEnum;
use strum_macros::Display;

/// The role of this process in a deployment.
///
/// The role is read once at startup and never changes. It decides whether operations run
/// in-process, are handed to the task queue, or are consumed from it.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// Serve HTTP and execute every operation in-process.
    All,
    /// Serve HTTP and hand operations to the task queue.
    Server,
    /// Consume operations from the task queue.
    Worker,
}

impl Role {
    /// Whether this role talks to a task queue.
    pub fn uses_queue(self) -> bool {
        !matches!(self, Self::All)
    }

    /// Whether this role serves the HTTP API.
    pub fn serves_http(self) -> bool {
        !matches!(self, Self::Worker)
    }
}
