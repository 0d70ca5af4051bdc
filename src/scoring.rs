//! Context-sensitive tool relevance scoring.
//!
//! Ranks tools for presentation by combining keyword overlap against the
//! caller's working context (active file type, stated intent, recent error
//! output) with a usage-frequency boost from persisted analytics. Scores
//! order suggestions only; they never gate which tools may be invoked.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::analytics::UsageAnalytics;
use crate::types::ToolDescriptor;

/// Usage count at which the analytics boost saturates.
const SATURATION_USES: u64 = 100;

// ─── Weights ─────────────────────────────────────────────────────────────────

/// Relative weight of each scoring signal.
///
/// The defaults are empirical constants carried over unchanged; treat them as
/// tuning knobs, not derived quantities.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    /// Keyword overlap between the active file type and the tool text.
    pub file_type: f64,
    /// Flat credit when the tool was used recently in this session.
    pub recent_usage: f64,
    /// Keyword overlap between the stated intent and the tool text.
    pub intent: f64,
    /// Keyword overlap between recent error output and the tool text.
    pub error_context: f64,
    /// Ceiling for the log-scale usage-count boost.
    pub usage_boost_max: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            file_type: 0.25,
            recent_usage: 0.15,
            intent: 0.30,
            error_context: 0.20,
            usage_boost_max: 0.10,
        }
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// What the caller is doing right now, as far as the host cares to say.
///
/// Every field is optional; absent fields contribute nothing to the score.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Extension or language of the file in focus, e.g. `"rs"` or `"python"`.
    pub file_type: Option<String>,
    /// Tool names invoked recently in this session.
    pub recent_tools: Vec<String>,
    /// Free-text description of what the user is trying to do.
    pub intent: Option<String>,
    /// Recent error output, when the user is debugging.
    pub error_text: Option<String>,
}

/// A tool together with its computed relevance.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredTool {
    pub server_id: String,
    pub name: String,
    pub score: f64,
}

// ─── Scorer ──────────────────────────────────────────────────────────────────

/// Scores tools against a [`ToolContext`].
///
/// Built once and reused. The analytics handle is optional so scoring works
/// before any usage history exists.
pub struct RelevanceScorer {
    weights: ScoringWeights,
    analytics: Option<Arc<UsageAnalytics>>,
}

impl RelevanceScorer {
    /// Scorer with default weights, backed by usage history.
    pub fn new(analytics: Arc<UsageAnalytics>) -> Self {
        Self {
            weights: ScoringWeights::default(),
            analytics: Some(analytics),
        }
    }

    /// Scorer with custom weights and optional usage history.
    pub fn with_weights(weights: ScoringWeights, analytics: Option<Arc<UsageAnalytics>>) -> Self {
        Self { weights, analytics }
    }

    /// Weighted relevance of one tool in the given context.
    ///
    /// Four signals, each clamped to [0, 1] before weighting, plus a usage
    /// boost that grows with the log of the persisted usage count and caps
    /// at `usage_boost_max`.
    pub fn score(&self, server_id: &str, tool: &ToolDescriptor, context: &ToolContext) -> f64 {
        let tool_tokens = tokenize(&format!("{} {}", tool.name, tool.description));

        let mut total = 0.0;

        if let Some(file_type) = &context.file_type {
            total += self.weights.file_type * keyword_overlap(file_type, &tool_tokens);
        }
        if context.recent_tools.iter().any(|name| name == &tool.name) {
            total += self.weights.recent_usage;
        }
        if let Some(intent) = &context.intent {
            total += self.weights.intent * keyword_overlap(intent, &tool_tokens);
        }
        if let Some(error_text) = &context.error_text {
            total += self.weights.error_context * keyword_overlap(error_text, &tool_tokens);
        }

        if let Some(analytics) = &self.analytics {
            let uses = analytics.usage_count(server_id, &tool.name);
            total += self.weights.usage_boost_max * usage_ratio(uses);
        }

        total
    }

    /// Score every tool, sort descending, keep the first `limit`.
    ///
    /// The order is advisory: callers use it to rank suggestions, never to
    /// decide which tools are callable.
    pub fn filter_by_context(
        &self,
        tools: &[(String, ToolDescriptor)],
        context: &ToolContext,
        limit: usize,
    ) -> Vec<ScoredTool> {
        let mut scored: Vec<ScoredTool> = tools
            .iter()
            .map(|(server_id, tool)| ScoredTool {
                server_id: server_id.clone(),
                name: tool.name.clone(),
                score: self.score(server_id, tool, context),
            })
            .collect();

        // Sort descending by score
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }
}

// ─── Signal Helpers ──────────────────────────────────────────────────────────

/// Share of the context's keywords that also appear in the tool text,
/// clamped to [0, 1]. Empty context text scores 0.
fn keyword_overlap(context_text: &str, tool_tokens: &HashSet<String>) -> f64 {
    let context_tokens = tokenize(context_text);
    if context_tokens.is_empty() {
        return 0.0;
    }
    let shared = context_tokens.intersection(tool_tokens).count();
    (shared as f64 / context_tokens.len() as f64).clamp(0.0, 1.0)
}

/// Log-scale usage ratio: 0 at zero uses, 1 at [`SATURATION_USES`] and beyond.
fn usage_ratio(uses: u64) -> f64 {
    if uses == 0 {
        return 0.0;
    }
    let ratio = ((1 + uses) as f64).ln() / ((1 + SATURATION_USES) as f64).ln();
    ratio.clamp(0.0, 1.0)
}

/// Lowercased alphanumeric words of at least two characters.
fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() >= 2)
        .map(str::to_string)
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
