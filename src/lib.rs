//! conductor: a workflow orchestration and resumption engine.
//!
//! Drives backlog items ("units") through an ordered phase pipeline,
//! executing independent units concurrently in conflict-aware batches.
//! All run state lives in an explicit, persisted document; after an
//! interruption the engine reconstructs each unit's position from the
//! live environment (branches, PRs, CI checks) rather than trusting the
//! saved record.
//!
//! The main seams:
//!
//! - [`state`]: the persisted run document and its atomic store.
//! - [`probe`]: read-only queries against git and GitHub.
//! - [`resume`]: the environment-authoritative resume decision table.
//! - [`planner`] and [`conflict`]: priority scoring and batch planning.
//! - [`phase`]: the per-unit phase state machine with quality gating.
//! - [`coordinator`]: bounded-concurrency batch execution.
//! - [`worker`]: the pluggable phase-executor interface.
//! - [`report`]: final run aggregation.

pub mod backlog;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod phase;
pub mod planner;
pub mod probe;
pub mod quality;
pub mod report;
pub mod resume;
pub mod state;
pub mod worker;

pub use config::OrchestratorConfig;
pub use coordinator::ParallelExecutionCoordinator;
pub use error::{OrchestratorError, OrchestratorResult};
pub use phase::PhaseStateMachine;
pub use planner::BatchPlanner;
pub use quality::QualityGateValidator;
pub use report::ReportAggregator;
pub use resume::ResumptionAnalyzer;
pub use state::{Phase, StateStore, UnitRecord, UnitStatus, WorkflowState};
pub use worker::{Worker, WorkerOutcome, WorkerRegistry};
