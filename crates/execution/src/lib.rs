//! Execution layer - dependency resolution, slot scheduling and the control
//! loop that drives executions through their lifecycle.

#![warn(missing_docs)]

pub mod selector;
pub mod dependency;
pub mod scheduler;
pub mod runner;
pub mod hooks;
pub mod config;
pub mod error;
pub mod clock;
pub mod engine;

pub use selector::{Candidate, ExecutionSelector, PrioritySelector};
pub use dependency::{CycleError, DependencyGraph, GraphNode, TaskGraph};
pub use scheduler::ResourceScheduler;
pub use runner::{Distributor, RunContext, RunnerError, WorkflowRunner};
pub use hooks::{Hook, HookContext, HookStage, Hooks};
pub use config::EngineConfig;
pub use error::EngineError;
pub use clock::EngineClock;
pub use engine::{ExecutionEngine, ExecutionStats, TickReport};
