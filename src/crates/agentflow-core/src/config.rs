//! Workflow configuration documents: the typed IR and the YAML/JSON loader.
//!
//! A workflow document declares a typed state, a set of LLM nodes and the
//! edges connecting them, plus optional global configuration (default LLM,
//! execution limits, observability, storage). Loading populates the typed
//! IR and reports the source line on structural errors; semantic checks
//! live in [`crate::validate`].

use llm::config::{LlmConfig, LlmOverride};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors from loading a configuration document
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML{}: {message}", location.as_ref().map(|(l, c)| format!(" at line {l}, column {c}")).unwrap_or_default())]
    Yaml {
        message: String,
        location: Option<(usize, usize)>,
    },

    #[error("invalid JSON at line {line}, column {column}: {message}")]
    Json {
        message: String,
        line: usize,
        column: usize,
    },
}

impl From<serde_yaml::Error> for ConfigLoadError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigLoadError::Yaml {
            message: err.to_string(),
            location: err.location().map(|l| (l.line(), l.column())),
        }
    }
}

impl From<serde_json::Error> for ConfigLoadError {
    fn from(err: serde_json::Error) -> Self {
        ConfigLoadError::Json {
            message: err.to_string(),
            line: err.line(),
            column: err.column(),
        }
    }
}

/// Top-level workflow document (immutable after load)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    pub schema_version: String,

    pub flow: FlowMeta,

    pub state: StateSection,

    pub nodes: Vec<NodeConfig>,

    pub edges: Vec<EdgeConfig>,

    #[serde(default)]
    pub config: GlobalConfig,
}

/// Flow metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowMeta {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// The `state:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateSection {
    pub fields: BTreeMap<String, StateFieldConfig>,
}

/// One declared state field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateFieldConfig {
    #[serde(rename = "type")]
    pub field_type: String,

    /// Explicit requiredness; absent means "required unless defaulted"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Reducer name: replace (default), append or sum
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reducer: Option<String>,
}

impl StateFieldConfig {
    /// A field with a default is optional unless explicitly marked required
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(self.default.is_none())
    }
}

/// One LLM node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub id: String,

    /// Prompt template; sent as the user message
    pub prompt: String,

    /// Optional system prompt template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Declared inputs: name → template resolved against state
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,

    /// State fields this node writes
    pub outputs: Vec<String>,

    /// Shape of the structured LLM response; defaults to `str`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<OutputSchemaConfig>,

    /// Tools bound for this node, by registry name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,

    /// Per-node LLM override merged over the global config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmOverride>,

    /// Log the provider's raw response at debug level
    #[serde(default)]
    pub log_raw_response: bool,
}

/// Output schema: a bare type string or a named field map
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSchemaConfig {
    Scalar(String),
    Object(BTreeMap<String, OutputFieldConfig>),
}

/// One output field: bare type string or `{type, description}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputFieldConfig {
    Simple(String),
    Detailed {
        #[serde(rename = "type")]
        field_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl OutputFieldConfig {
    pub fn type_str(&self) -> &str {
        match self {
            OutputFieldConfig::Simple(ty) => ty,
            OutputFieldConfig::Detailed { field_type, .. } => field_type,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            OutputFieldConfig::Simple(_) => None,
            OutputFieldConfig::Detailed { description, .. } => description.as_deref(),
        }
    }
}

/// Edge forms. Order matters: serde tries variants top to bottom, so the
/// most specific shapes come first. Each variant denies unknown fields so
/// a typo'd `loop:`/`parallel:` key fails loudly instead of silently
/// matching the linear form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeConfig {
    Conditional(ConditionalEdge),
    Loop(LoopEdge),
    Parallel(ParallelEdge),
    Linear(LinearEdge),
}

/// `{from, routes, default}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalEdge {
    pub from: String,
    pub routes: Vec<RouteConfig>,
    pub default: String,
}

/// `{from, to, loop: {condition, max_iterations}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "loop")]
    pub spec: LoopConfig,
}

/// `{from, to, parallel: {items, collect, each}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelEdge {
    pub from: String,
    pub to: String,
    pub parallel: ParallelConfig,
}

/// `{from, to}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinearEdge {
    pub from: String,
    pub to: String,
}

impl EdgeConfig {
    pub fn from_node(&self) -> &str {
        match self {
            EdgeConfig::Conditional(edge) => &edge.from,
            EdgeConfig::Loop(edge) => &edge.from,
            EdgeConfig::Parallel(edge) => &edge.from,
            EdgeConfig::Linear(edge) => &edge.from,
        }
    }
}

/// One conditional route
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub condition: String,
    pub to: String,
}

/// Loop edge parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopConfig {
    pub condition: String,
    pub max_iterations: u32,
}

/// Parallel edge parameters. Field references accept the `state.` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelConfig {
    /// List field to fan out over
    pub items: String,

    /// Append-reduced list collecting branch results
    pub collect: String,

    /// Field receiving the branch's element
    pub each: String,
}

impl ParallelConfig {
    pub fn items_field(&self) -> &str {
        strip_state(&self.items)
    }

    pub fn collect_field(&self) -> &str {
        strip_state(&self.collect)
    }

    pub fn each_field(&self) -> &str {
        strip_state(&self.each)
    }
}

fn strip_state(reference: &str) -> &str {
    reference.strip_prefix("state.").unwrap_or(reference)
}

/// The optional `config:` block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
}

fn default_timeout_seconds() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_parallel_max_concurrency() -> usize {
    8
}

/// Execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Per-run deadline in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Provider retry budget
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound on concurrently running parallel branches
    #[serde(default = "default_parallel_max_concurrency")]
    pub parallel_max_concurrency: usize,

    #[serde(default)]
    pub parallel_failure_policy: ParallelFailurePolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            max_retries: default_max_retries(),
            parallel_max_concurrency: default_parallel_max_concurrency(),
            parallel_failure_policy: ParallelFailurePolicy::default(),
        }
    }
}

/// What to do when a parallel branch fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelFailurePolicy {
    /// Cancel remaining branches and propagate the first error
    #[default]
    FailFast,

    /// Record failures as error placeholders and continue
    CollectErrors,
}

/// Observability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,

    #[serde(default = "default_true")]
    pub async_logging: bool,

    #[serde(default)]
    pub artifact_level: ArtifactLevel,
}

fn default_true() -> bool {
    true
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tracking_uri: None,
            experiment_name: None,
            async_logging: true,
            artifact_level: ArtifactLevel::default(),
        }
    }
}

/// How much per-node detail the observability sink records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactLevel {
    Minimal,
    #[default]
    Standard,
    Full,
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Backend name: sqlite or memory
    pub backend: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl WorkflowConfig {
    /// Parse a YAML document
    pub fn from_yaml(source: &str) -> Result<Self, ConfigLoadError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Parse a JSON document
    pub fn from_json(source: &str) -> Result<Self, ConfigLoadError> {
        Ok(serde_json::from_str(source)?)
    }

    /// Load from a file, choosing the format by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&source),
            _ => Self::from_yaml(&source),
        }
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The effective default LLM config (Ollama when none is declared)
    pub fn default_llm(&self) -> LlmConfig {
        self.config
            .llm
            .clone()
            .unwrap_or_else(|| LlmConfig::new("ollama", "llama3"))
    }
}
