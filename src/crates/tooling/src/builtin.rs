//! Built-in tool set registered at startup

use crate::{Result, Tool, ToolError, ToolRegistry};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Register the built-in tools on `registry`
pub fn register_builtins(registry: &ToolRegistry) {
    registry.register(
        "current_time",
        Box::new(|| Ok(Arc::new(CurrentTimeTool) as Arc<dyn Tool>)),
    );
    registry.register(
        "calculator",
        Box::new(|| Ok(Arc::new(CalculatorTool) as Arc<dyn Tool>)),
    );
    registry.register(
        "http_get",
        Box::new(|| {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| ToolError::Construction {
                    name: "http_get".to_string(),
                    reason: e.to_string(),
                })?;
            Ok(Arc::new(HttpGetTool { client }) as Arc<dyn Tool>)
        }),
    );
}

/// Returns the current UTC time
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Returns the current date and time in UTC (RFC 3339)"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn invoke(&self, _args: Value) -> Result<Value> {
        Ok(json!({"now": chrono::Utc::now().to_rfc3339()}))
    }
}

/// Two-operand arithmetic
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Applies an arithmetic operation (add, subtract, multiply, divide) to two numbers"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["add", "subtract", "multiply", "divide"],
                    "description": "The operation to apply"
                },
                "a": {"type": "number", "description": "Left operand"},
                "b": {"type": "number", "description": "Right operand"}
            },
            "required": ["operation", "a", "b"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let number = |key: &str| -> Result<f64> {
            args.get(key)
                .and_then(Value::as_f64)
                .ok_or_else(|| ToolError::InvalidArguments {
                    name: "calculator".to_string(),
                    reason: format!("'{key}' must be a number"),
                })
        };

        let a = number("a")?;
        let b = number("b")?;
        let op = args.get("operation").and_then(Value::as_str).ok_or_else(|| {
            ToolError::InvalidArguments {
                name: "calculator".to_string(),
                reason: "'operation' must be a string".to_string(),
            }
        })?;

        let result = match op {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b == 0.0 {
                    return Err(ToolError::Execution {
                        name: "calculator".to_string(),
                        reason: "division by zero".to_string(),
                    });
                }
                a / b
            }
            other => {
                return Err(ToolError::InvalidArguments {
                    name: "calculator".to_string(),
                    reason: format!("unknown operation '{other}'"),
                })
            }
        };

        Ok(json!({"result": result}))
    }
}

/// Fetches a URL and returns the response body as text
pub struct HttpGetTool {
    pub(crate) client: reqwest::Client,
}

#[async_trait]
impl Tool for HttpGetTool {
    fn name(&self) -> &str {
        "http_get"
    }

    fn description(&self) -> &str {
        "Performs an HTTP GET request and returns the status and body text"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "The URL to fetch"}
            },
            "required": ["url"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let url = args.get("url").and_then(Value::as_str).ok_or_else(|| {
            ToolError::InvalidArguments {
                name: "http_get".to_string(),
                reason: "'url' must be a string".to_string(),
            }
        })?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::Execution {
                name: "http_get".to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| ToolError::Execution {
            name: "http_get".to_string(),
            reason: e.to_string(),
        })?;

        Ok(json!({"status": status, "body": body}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_time_shape() {
        let result = CurrentTimeTool.invoke(json!({})).await.unwrap();
        assert!(result["now"].is_string());
    }

    #[tokio::test]
    async fn test_calculator_add() {
        let result = CalculatorTool
            .invoke(json!({"operation": "add", "a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(result["result"], 5.0);
    }

    #[tokio::test]
    async fn test_calculator_divide_by_zero() {
        let err = CalculatorTool
            .invoke(json!({"operation": "divide", "a": 1, "b": 0}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[tokio::test]
    async fn test_calculator_rejects_bad_args() {
        let err = CalculatorTool
            .invoke(json!({"operation": "add", "a": "x", "b": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn test_schemas_are_objects() {
        for tool in [
            Box::new(CurrentTimeTool) as Box<dyn Tool>,
            Box::new(CalculatorTool),
        ] {
            let schema = tool.input_schema();
            assert_eq!(schema["type"], "object");
        }
    }
}
