//! Per-model price table and cost computation.
//!
//! Costs are derived from provider-reported usage, never estimated from
//! text. Local providers (Ollama) are free; unknown models cost zero so a
//! missing table entry never fails a run.

use crate::Usage;

/// USD cost per single token for a (provider, model) pair
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub cost_per_input_token: f64,
    pub cost_per_output_token: f64,
}

impl ModelPricing {
    pub fn cost(&self, usage: &Usage) -> f64 {
        usage.input_tokens as f64 * self.cost_per_input_token
            + usage.output_tokens as f64 * self.cost_per_output_token
    }
}

/// Static price table, USD per token. Longer model names come before
/// their prefixes so `gpt-4o-mini` never matches the `gpt-4o` entry.
fn price_table() -> &'static [(&'static str, &'static str, f64, f64)] {
    &[
        // OpenAI
        ("openai", "gpt-4o-mini", 0.000_000_15, 0.000_000_6),
        ("openai", "gpt-4o", 0.000_002_5, 0.000_010),
        ("openai", "gpt-4-turbo", 0.000_010, 0.000_030),
        ("openai", "gpt-3.5-turbo", 0.000_000_5, 0.000_001_5),
        // Anthropic
        ("anthropic", "claude-3-opus", 0.000_015, 0.000_075),
        ("anthropic", "claude-3-5-sonnet", 0.000_003, 0.000_015),
        ("anthropic", "claude-3-5-haiku", 0.000_000_8, 0.000_004),
        ("anthropic", "claude-3-haiku", 0.000_000_25, 0.000_001_25),
        // Google
        ("google", "gemini-1.5-pro", 0.000_001_25, 0.000_005),
        ("google", "gemini-1.5-flash", 0.000_000_075, 0.000_000_3),
        ("google", "gemini-pro", 0.000_000_5, 0.000_001_5),
    ]
}

/// Look up pricing for a model. Ollama (and any unknown model) is free.
pub fn lookup(provider: &str, model: &str) -> ModelPricing {
    if provider == "ollama" {
        return ModelPricing {
            cost_per_input_token: 0.0,
            cost_per_output_token: 0.0,
        };
    }

    price_table()
        .iter()
        .find(|(p, m, _, _)| *p == provider && model.starts_with(m))
        .map(|(_, _, input, output)| ModelPricing {
            cost_per_input_token: *input,
            cost_per_output_token: *output,
        })
        .unwrap_or(ModelPricing {
            cost_per_input_token: 0.0,
            cost_per_output_token: 0.0,
        })
}

/// USD cost of a call given provider-reported usage
pub fn cost_for(provider: &str, model: &str, usage: &Usage) -> f64 {
    lookup(provider, model).cost(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_cost() {
        let usage = Usage::new(1000, 500);
        let cost = cost_for("anthropic", "claude-3-5-sonnet", &usage);
        let expected = 1000.0 * 0.000_003 + 500.0 * 0.000_015;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn test_model_version_prefix_matches() {
        let usage = Usage::new(100, 100);
        // Dated model ids still hit the family entry
        let cost = cost_for("anthropic", "claude-3-5-sonnet-20241022", &usage);
        assert!(cost > 0.0);
    }

    #[test]
    fn test_ollama_is_free() {
        let usage = Usage::new(100_000, 100_000);
        assert_eq!(cost_for("ollama", "llama3", &usage), 0.0);
    }

    #[test]
    fn test_unknown_model_is_zero_not_error() {
        let usage = Usage::new(10, 10);
        assert_eq!(cost_for("openai", "gpt-99", &usage), 0.0);
    }
}
