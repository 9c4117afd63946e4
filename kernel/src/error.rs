//! Error and status types for the scheduling core.
//!
//! Following §7's taxonomy: transient and external conditions come back as
//! [`WaitStatus`] (never panics), programming errors come back as
//! [`CoreError`] and are additionally `debug_assert!`-checked so debug
//! builds abort immediately, and invariant violations go through
//! [`crate::engine::Core::fatal`] rather than either of these.

use thiserror::Error;

/// Status returned from the wait-word surface (§6, §7).
///
/// Mirrors the literal codes named in the specification so the wire-level
/// meaning survives translation into an enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// 0 = woken.
    Woken,
    /// `EAGAIN` — the word did not hold the expected value.
    Again,
    /// `ETIMEDOUT`.
    TimedOut,
    /// `EINTR` — external cancellation.
    Interrupted,
}

impl WaitStatus {
    /// The numeric status code a syscall-style surface would return.
    pub const fn code(self) -> i32 {
        match self {
            WaitStatus::Woken => 0,
            WaitStatus::Again => -11,   // EAGAIN
            WaitStatus::TimedOut => -110, // ETIMEDOUT
            WaitStatus::Interrupted => -4, // EINTR
        }
    }
}

/// Programming and capacity errors surfaced from the core (§7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// `EINVAL` — an invalid flag combination was requested.
    #[error("invalid flags")]
    InvalidFlags,
    /// `EDEADLK` — adding this dependency edge would create a cycle.
    #[error("dependency edge would create a cycle")]
    WouldCreateCycle,
    /// Enqueuing a task that is not in the `Ready` state.
    #[error("enqueue of non-ready task")]
    NotReady,
    /// Dequeuing / operating on a task id the core has no record of.
    #[error("unknown task id")]
    UnknownTask,
    /// Dequeue of a task not present in any run-queue.
    #[error("dequeue of non-present task")]
    NotEnqueued,
}

/// Reasons the core halts per §7's "Fatal" class.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    #[error("task {0} has deadline < vruntime")]
    DeadlineBeforeVruntime(u64),
    #[error("task {0} is Running but present in a run-queue ready set")]
    RunningTaskInReadyQueue(u64),
    #[error("run-queue min_vruntime decreased from {0} to {1}")]
    MinVruntimeRegressed(u64, u64),
    #[error("burst score out of range: {0}")]
    BurstScoreOutOfRange(i32),
    #[error("dependency graph contains a cycle through task {0}")]
    DependencyCycle(u64),
}
