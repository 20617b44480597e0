//! Tool trait, registry and built-in tools for agentflow
//!
//! A [`Tool`] is a named callable with a JSON input schema that a workflow
//! node can expose to the LLM. The [`ToolRegistry`] maps tool names to lazy
//! factories: a tool (including any API-key lookup its constructor does) is
//! not instantiated until the first `get` for its name.
//!
//! # Example
//!
//! ```rust
//! use tooling::ToolRegistry;
//!
//! let registry = ToolRegistry::with_builtins();
//! assert!(registry.has("current_time"));
//!
//! let names = registry.names();
//! assert!(names.contains(&"calculator".to_string()));
//! ```

pub mod builtin;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur when looking up or invoking tools
#[derive(Debug, Error)]
pub enum ToolError {
    /// Requested tool is not registered
    #[error("unknown tool '{name}'. Registered tools: {available}{}", suggestion.as_ref().map(|s| format!(". Did you mean '{}'?", s)).unwrap_or_default())]
    NotFound {
        name: String,
        available: String,
        suggestion: Option<String>,
    },

    /// Tool constructor failed (missing API key, bad config, ...)
    #[error("failed to construct tool '{name}': {reason}")]
    Construction { name: String, reason: String },

    /// Tool received arguments it cannot work with
    #[error("invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    /// Tool ran and failed
    #[error("tool '{name}' failed: {reason}")]
    Execution { name: String, reason: String },
}

/// Result type for tool operations
pub type Result<T> = std::result::Result<T, ToolError>;

/// A named callable exposed to the LLM.
///
/// `input_schema` must return a JSON-schema object describing the tool's
/// parameters; providers forward it verbatim in their tool declarations.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable tool name, as referenced from workflow configs
    fn name(&self) -> &str;

    /// Human/model readable description of what the tool does
    fn description(&self) -> &str;

    /// JSON schema for the tool's input object
    fn input_schema(&self) -> Value;

    /// Invoke the tool with a JSON argument object
    async fn invoke(&self, args: Value) -> Result<Value>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

/// Factory producing a tool on first use
pub type ToolFactory = Box<dyn Fn() -> Result<Arc<dyn Tool>> + Send + Sync>;

struct RegistryInner {
    factories: HashMap<String, ToolFactory>,
    instances: HashMap<String, Arc<dyn Tool>>,
}

/// Name → tool lookup with lazy instantiation.
///
/// The built-in set is fixed at startup via [`ToolRegistry::with_builtins`];
/// custom tools are added with [`ToolRegistry::register`] before graph
/// build. Registrations after startup are serialized behind a mutex.
pub struct ToolRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                factories: HashMap::new(),
                instances: HashMap::new(),
            }),
        }
    }

    /// Create a registry pre-populated with the built-in tools
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        builtin::register_builtins(&registry);
        registry
    }

    /// Register a tool factory under `name`.
    ///
    /// Replaces any existing registration with the same name.
    pub fn register(&self, name: impl Into<String>, factory: ToolFactory) {
        let name = name.into();
        tracing::debug!(tool = %name, "Registering tool");
        let mut inner = self.inner.lock();
        inner.instances.remove(&name);
        inner.factories.insert(name, factory);
    }

    /// Whether a tool name is registered (instantiated or not)
    pub fn has(&self, name: &str) -> bool {
        self.inner.lock().factories.contains_key(name)
    }

    /// Sorted list of registered tool names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get a tool by name, instantiating it on first use.
    ///
    /// Unknown names fail with the list of registered tools and, when one
    /// is close enough, a typo suggestion.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>> {
        let mut inner = self.inner.lock();

        if let Some(tool) = inner.instances.get(name) {
            return Ok(Arc::clone(tool));
        }

        match inner.factories.get(name) {
            Some(factory) => {
                let tool = factory()?;
                inner.instances.insert(name.to_string(), Arc::clone(&tool));
                Ok(tool)
            }
            None => {
                let mut names: Vec<String> = inner.factories.keys().cloned().collect();
                names.sort();
                Err(ToolError::NotFound {
                    name: name.to_string(),
                    available: names.join(", "),
                    suggestion: nearest_name(name, &names),
                })
            }
        }
    }
}

/// Nearest registered name within edit distance 2, if any
pub fn nearest_name(name: &str, candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .map(|c| (strsim::levenshtein(name, c), c))
        .filter(|(d, _)| *d <= 2)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes its input back"
        }

        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }

        async fn invoke(&self, args: Value) -> Result<Value> {
            Ok(args)
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = ToolRegistry::new();
        registry.register("echo", Box::new(|| Ok(Arc::new(EchoTool) as Arc<dyn Tool>)));

        assert!(registry.has("echo"));
        let tool = registry.get("echo").unwrap();
        assert_eq!(tool.name(), "echo");
    }

    #[test]
    fn test_lazy_instantiation() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let built = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new();
        let counter = Arc::clone(&built);
        registry.register(
            "echo",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(EchoTool) as Arc<dyn Tool>)
            }),
        );

        // Nothing constructed until first get
        assert_eq!(built.load(Ordering::SeqCst), 0);

        registry.get("echo").unwrap();
        registry.get("echo").unwrap();

        // Cached after the first construction
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_tool_suggests_nearest() {
        let registry = ToolRegistry::new();
        registry.register("calculator", Box::new(|| Ok(Arc::new(EchoTool) as Arc<dyn Tool>)));

        let err = registry.get("calcultor").unwrap_err();
        match err {
            ToolError::NotFound { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("calculator"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_tool_lists_registered() {
        let registry = ToolRegistry::new();
        registry.register("echo", Box::new(|| Ok(Arc::new(EchoTool) as Arc<dyn Tool>)));

        let err = registry.get("completely_different").unwrap_err();
        assert!(err.to_string().contains("echo"));
    }

    #[tokio::test]
    async fn test_invoke_roundtrip() {
        let registry = ToolRegistry::new();
        registry.register("echo", Box::new(|| Ok(Arc::new(EchoTool) as Arc<dyn Tool>)));

        let tool = registry.get("echo").unwrap();
        let result = tool.invoke(json!({"text": "hi"})).await.unwrap();
        assert_eq!(result["text"], "hi");
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        assert!(registry.has("current_time"));
        assert!(registry.has("calculator"));
        assert!(registry.has("http_get"));
    }
}
