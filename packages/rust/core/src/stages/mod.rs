//! Stage executors.
//!
//! Every per-keyword stage takes its input record by value and returns the
//! next one, so a run that is abandoned midway never surfaces a partially
//! written document. External calls go through the run's [`CallAdapter`];
//! a stage's call count is the adapter tally diffed across the stage.
//!
//! [`CallAdapter`]: crate::llm::CallAdapter

pub mod context;
pub mod generate;
pub mod link;
pub mod refine;
pub mod verify;
