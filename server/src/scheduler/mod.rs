//! The persistent priority scheduler: process registry, admission queue,
//! and the executor that dispatches admitted work to action handlers.

pub mod executor;
pub mod queue;
pub mod registry;

pub use executor::{
    preemptable_sleep, ActionHandler, ProcessExecutor, RunOutcome, SleepOutcome, YieldCheck,
    YIELD_QUANTUM,
};
pub use queue::{QueueManager, QueueStats};
pub use registry::ProcessRegistry;
