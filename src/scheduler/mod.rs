//! Cooperative Task Scheduler
//!
//! - Single-threaded, no preemption
//! - Progress happens only inside explicit `proceed` calls
//! - Units return a re-arm decision instead of touching the queue

mod task_manager;

pub use task_manager::{TaskManager, TaskOutcome};
