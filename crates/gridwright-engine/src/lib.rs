//! Job enablement and submit-artifact generation for Condor-style batch
//! schedulers.
//!
//! The engine takes the jobs of a planned workflow and decides, per job,
//! how the job is launched: directly, through an instrumented launcher,
//! through a worker-node bootstrap script, through a relay dispatch tool,
//! through a cloud batch launcher, or as part of a sequenced cluster. It
//! then writes the scheduler's submit files, the auxiliary files the jobs
//! need and the workflow's DAG file.
//!
//! The entry point is [`Assembler`]; the building blocks (the argument
//! [`quote`]r, the environment [`escape`]r, the [`strategy`] variants and
//! the scheduling [`policy`]) are usable on their own.

pub mod assembler;
pub mod catalog;
pub mod classad;
pub mod config;
pub mod dag;
pub mod env;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod policy;
pub mod quote;
pub mod sequencer;
pub mod strategy;
pub mod style;
pub mod submit;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use assembler::Assembler;
pub use assembler::Assembly;
pub use catalog::InMemoryCatalog;
pub use config::Config;
pub use env::EnvironmentProfile;
pub use env::escape;
pub use error::EngineError;
pub use error::EngineResult;
pub use job::AggregatedJob;
pub use job::Job;
pub use job::JobClass;
pub use quote::QuoteError;
pub use quote::quote;
pub use strategy::StrategyKind;
pub use workflow::Workflow;
