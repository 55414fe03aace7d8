//! Resource-gated launcher for many invocations of one experiment program.
//!
//! Jobs are parameter sets; the [`core::scheduler::Scheduler`] holds them in a
//! FIFO queue and releases them one per poll interval while free memory, CPU
//! load and a concurrency cap allow, asking the [`core::gpu::GpuAllocator`] for
//! a device when a job did not name one.

pub mod config;
pub mod core;
pub mod utils;

pub use crate::core::job::{JobSpec, JobState, ParamValue};
pub use crate::core::scheduler::{Scheduler, SchedulerBuilder, StatusReport};
