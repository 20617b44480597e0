//! Core workflow engine for agentflow.
//!
//! This crate is the compiler and runtime for declarative LLM workflows: a
//! YAML/JSON document describing a typed state, templated LLM nodes and
//! four kinds of edges (linear, conditional, loop, parallel) is loaded
//! into a typed IR ([`config`]), semantically validated ([`validate`]) and
//! assembled into an executable graph ([`graph`]).
//!
//! # Pipeline
//!
//! ```text
//! YAML/JSON ──► config ──► validate ──► build_workflow ──► invoke
//!                              │              │
//!                         all issues     state schema,
//!                         in one pass    output models,
//!                                        compiled routes
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use agentflow_core::{build_workflow, validate, CancelToken, NoopHooks, WorkflowConfig};
//! use std::sync::Arc;
//!
//! let config = WorkflowConfig::from_file("workflow.yaml")?;
//! let registry = Arc::new(tooling::ToolRegistry::with_builtins());
//! validate(&config, &registry)?;
//!
//! let workflow = build_workflow(&config, Arc::clone(&registry), &make_client)?;
//! let state = workflow.initial_state(inputs)?;
//! let final_state = workflow.invoke(state, &NoopHooks, &CancelToken::new()).await?;
//! ```

pub mod cancel;
pub mod config;
pub mod expr;
pub mod graph;
pub mod node;
pub mod output;
pub mod state;
pub mod template;
pub mod types;
pub mod validate;

pub use cancel::CancelToken;
pub use config::{
    ConfigLoadError, EdgeConfig, ExecutionConfig, GlobalConfig, NodeConfig,
    ObservabilityConfig, ParallelFailurePolicy, StateFieldConfig, StorageConfig,
    WorkflowConfig,
};
pub use expr::{Expr, ExprError};
pub use graph::{
    build_workflow, GraphBuildError, NodeBoundary, NoopHooks, RunHooks, Workflow,
    WorkflowError, END, START,
};
pub use node::{NodeError, NodePhase, NodeRun};
pub use output::{OutputError, OutputModel};
pub use state::{Delta, Reducer, StateError, StateSchema, WorkflowState};
pub use template::TemplateError;
pub use types::{FieldType, TypeParseError};
pub use validate::{validate, ConfigValidationError, IssueKind, ValidationIssue};
