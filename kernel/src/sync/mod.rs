pub mod spin;

pub use spin::{InterruptControl, Mutex, MutexNoIrq};

/// Alias used by the rest of the core: every short critical section named
/// in §5 (run-queue mutation, wait-word bucket locking, dependency-edge
/// list locking) is a "local lock" in the sense of owning a single CPU's
/// data and never being held across a suspension point.
pub type LocalLock<T> = MutexNoIrq<T>;
