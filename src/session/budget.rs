//! Context budget threshold parsing and usage accounting.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Session reset threshold, relative to the configured budget or absolute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContextLimit {
    /// Share of the budget (e.g. 80%)
    Percentage(f32),
    /// Absolute character count
    Absolute(usize),
}

impl ContextLimit {
    /// Effective character threshold for a budget.
    pub fn effective_limit(&self, budget_chars: usize) -> usize {
        match self {
            ContextLimit::Percentage(pct) => ((budget_chars as f64) * (*pct as f64 / 100.0)) as usize,
            ContextLimit::Absolute(chars) => *chars,
        }
    }
}

impl Default for ContextLimit {
    fn default() -> Self {
        ContextLimit::Percentage(80.0)
    }
}

impl std::fmt::Display for ContextLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextLimit::Percentage(pct) => write!(f, "{}%", pct),
            ContextLimit::Absolute(chars) => write!(f, "{}", chars),
        }
    }
}

/// Parse a threshold string: `"80%"` or an absolute character count.
pub fn parse_context_limit(s: &str) -> Result<ContextLimit> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Context limit cannot be empty");
    }

    if let Some(num_str) = s.strip_suffix('%') {
        let pct: f32 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid percentage in context limit: {}", s))?;
        if pct <= 0.0 || pct > 100.0 {
            anyhow::bail!(
                "Context limit percentage must be between 0 and 100, got {}",
                pct
            );
        }
        Ok(ContextLimit::Percentage(pct))
    } else {
        let chars: usize = s
            .parse()
            .with_context(|| format!("Invalid absolute context limit: {}", s))?;
        if chars == 0 {
            anyhow::bail!("Context limit cannot be zero");
        }
        Ok(ContextLimit::Absolute(chars))
    }
}

/// Context consumed by one dispatch.
///
/// Workers that report token usage are authoritative; otherwise the prompt
/// and output sizes stand in for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextUsage {
    Reported { input_tokens: u64, output_tokens: u64 },
    Estimated { prompt_chars: usize, output_chars: usize },
}

impl ContextUsage {
    /// Consumption in characters.
    pub fn chars(&self, chars_per_token: usize) -> usize {
        match *self {
            ContextUsage::Reported {
                input_tokens,
                output_tokens,
            } => (input_tokens + output_tokens) as usize * chars_per_token,
            ContextUsage::Estimated {
                prompt_chars,
                output_chars,
            } => prompt_chars + output_chars,
        }
    }

    pub fn is_reported(&self) -> bool {
        matches!(self, ContextUsage::Reported { .. })
    }
}
