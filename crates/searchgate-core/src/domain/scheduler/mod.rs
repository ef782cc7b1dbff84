//! Recurring trigger for the indexing queue drain

pub mod runner;

pub use runner::{IndexingScheduler, SchedulerSettings, TickOutcome};
