//! Core pipeline orchestration and domain logic for articleforge.
//!
//! This crate ties the external call adapter, the five per-keyword stages,
//! merge/assembly and the standalone freshness refresh into end-to-end
//! workflows (e.g., [`pipeline::run_batch`]).

pub mod guard;
pub mod llm;
pub mod merge;
pub mod pipeline;
pub mod prompts;
pub mod refresh;
pub mod retry;
pub mod stages;
pub mod testing;
pub mod toc;
