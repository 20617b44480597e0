//! agentflow: runtime orchestrator for declarative LLM workflows.
//!
//! A workflow is a YAML/JSON document describing a typed state, templated
//! LLM nodes and edges (linear, conditional, loop, parallel). This crate
//! owns the end-to-end run path — validate, build, execute, persist,
//! trace — on top of [`agentflow_core`], and ships the `agentflow` CLI.
//!
//! # Example
//!
//! ```rust,ignore
//! use agentflow::{Runner, RunOptions, TracingSink};
//! use agentflow_core::WorkflowConfig;
//! use agentflow_storage::Storage;
//! use std::sync::Arc;
//!
//! let config = WorkflowConfig::from_file("workflow.yaml")?;
//! let storage = Storage::in_memory();
//! let runner = Runner::new(storage, Arc::new(TracingSink::new()));
//!
//! let report = runner.run(&config, inputs, RunOptions::default()).await?;
//! println!("{}: {:?}", report.execution_id, report.status);
//! ```

pub mod events;
pub mod runtime;

pub use events::{NoopTracer, SpanHandle, SpanMetrics, TracingSink, WorkflowTracer};
pub use runtime::{RunOptions, RunReport, RunStatus, Runner, RunnerError};

/// Process exit codes for the CLI
pub mod exit_codes {
    /// Run completed successfully
    pub const SUCCESS: i32 = 0;
    /// Runtime error, including workflow failure
    pub const RUNTIME_ERROR: i32 = 1;
    /// Configuration error (load or validation)
    pub const CONFIG_ERROR: i32 = 2;
    /// Bad command-line usage
    pub const USAGE_ERROR: i32 = 3;
}
