//! A gaming-aware task scheduling and synchronization core (see
//! `SPEC_FULL.md` at the workspace root for the full external contract).
//!
//! This crate is a hosted scheduling *library*: it owns the task table,
//! run queues, dependency graph and wait-word primitive, and exposes the
//! decisions (who runs next, who to wake, where to place a task) to a
//! caller that owns the actual execution contexts. It does not itself
//! context-switch, allocate address spaces, or read hardware — all of
//! that is behind the [`Timebase`](timebase::Timebase) and
//! [`WordSource`](waitword::WordSource) collaborator traits, or left to
//! the embedding kernel.

#![allow(unused)]

#[macro_use]
extern crate log;

pub mod burst;
pub mod config;
pub mod depgraph;
pub mod engine;
pub mod error;
pub mod frame;
pub mod logging;
pub mod placement;
pub mod runqueue;
pub mod stats;
pub mod sync;
pub mod task;
pub mod timebase;
pub mod topology;
pub mod waitword;

pub use config::SchedConfig;
pub use depgraph::{DependencyGraph, DependencyKind};
pub use engine::Core;
pub use error::{CoreError, FatalReason, WaitStatus};
pub use frame::FrameState;
pub use placement::Placement;
pub use runqueue::RunQueue;
pub use stats::{Stats, StatsSnapshot};
pub use task::{GamingTags, Task, TaskId, TaskState, VTime};
pub use timebase::{SystemTimebase, Timebase};
pub use topology::{CpuClass, CpuFacts, Topology};
pub use waitword::{WaitFlags, WaitHandle, WaitOutcome, WaiterType, WordSource};
