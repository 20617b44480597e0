//! Prompt and input-map template resolution.
//!
//! Templates use `{name}` placeholders; `{state.name}` is equivalent (the
//! `state.` prefix is part of the reference syntax, not the variable name).
//! `{{` and `}}` escape literal braces. Placeholder names are simple
//! single-segment identifiers; resolution is a single pass over the
//! template.

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from template resolution
#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("missing template variable '{name}'. Available: {available}")]
    MissingVar { name: String, available: String },

    #[error("malformed template: {reason}")]
    Malformed { reason: String },
}

/// Strip the optional `state.` reference prefix from a placeholder name
fn strip_state_prefix(name: &str) -> &str {
    name.strip_prefix("state.").unwrap_or(name)
}

/// Render `template` substituting placeholders from `vars`.
///
/// Non-string values are rendered as compact JSON; strings are inserted
/// verbatim. Missing variables fail with the variable name and the sorted
/// list of available names.
pub fn render(template: &str, vars: &Map<String, Value>) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                output.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                output.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' => {
                            name.push(ch)
                        }
                        Some(ch) => {
                            return Err(TemplateError::Malformed {
                                reason: format!("invalid character '{ch}' in placeholder"),
                            })
                        }
                        None => {
                            return Err(TemplateError::Malformed {
                                reason: "unclosed placeholder".to_string(),
                            })
                        }
                    }
                }

                let key = strip_state_prefix(&name);
                match vars.get(key) {
                    Some(Value::String(s)) => output.push_str(s),
                    Some(value) => output.push_str(&value.to_string()),
                    None => {
                        let mut available: Vec<&str> = vars
                            .keys()
                            .filter(|k| !k.starts_with("__"))
                            .map(String::as_str)
                            .collect();
                        available.sort_unstable();
                        return Err(TemplateError::MissingVar {
                            name: key.to_string(),
                            available: available.join(", "),
                        });
                    }
                }
            }
            '}' => {
                return Err(TemplateError::Malformed {
                    reason: "unmatched '}'".to_string(),
                })
            }
            other => output.push(other),
        }
    }

    Ok(output)
}

/// Placeholder names referenced by a template, `state.` prefix stripped.
///
/// Malformed templates yield the placeholders seen before the defect; the
/// validator reports the defect separately via [`render`] on a probe pass.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
            }
            '{' => {
                let mut name = String::new();
                for ch in chars.by_ref() {
                    if ch == '}' {
                        break;
                    }
                    name.push(ch);
                }
                if !name.is_empty() {
                    names.push(strip_state_prefix(&name).to_string());
                }
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
            }
            _ => {}
        }
    }

    names
}
