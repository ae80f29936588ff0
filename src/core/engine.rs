//! Rule evaluation
//!
//! Categories are checked in a fixed order: reset, close, ignore, rewrite.
//! Within a category scope-specific rules run before bidirectional ones.
//! Evaluation is synchronous and never suspends.

use bytes::Bytes;
use std::borrow::Cow;
use std::sync::Arc;

use super::rules::{Direction, RuleSet};

/// Outcome of evaluating one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Write the (possibly rewritten) chunk to the opposite peer
    Forward(Bytes),
    /// Discard the chunk silently
    Drop,
    /// Forward the chunk unchanged, then shut the session down gracefully
    CloseGracefully(Bytes),
    /// Abort the session immediately; the chunk is not forwarded
    ResetAbruptly,
}

impl Disposition {
    pub fn name(&self) -> &'static str {
        match self {
            Disposition::Forward(_) => "forward",
            Disposition::Drop => "ignore",
            Disposition::CloseGracefully(_) => "close",
            Disposition::ResetAbruptly => "reset",
        }
    }
}

/// Evaluates a shared, frozen `RuleSet`
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Arc<RuleSet>,
}

impl RuleEngine {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Decide what happens to `chunk` travelling in `direction`
    pub fn evaluate(&self, chunk: Bytes, direction: Direction) -> Disposition {
        let rules = &self.rules;

        if rules.resets(direction).any(|p| p.is_match(&chunk)) {
            return Disposition::ResetAbruptly;
        }
        if rules.closes(direction).any(|p| p.is_match(&chunk)) {
            return Disposition::CloseGracefully(chunk);
        }
        if rules.ignores(direction).any(|p| p.is_match(&chunk)) {
            return Disposition::Drop;
        }

        // Substitutions accumulate: each rewrite sees the previous one's output.
        let mut rewritten: Option<Vec<u8>> = None;
        for (pattern, replacement) in rules.rewrites(direction) {
            let haystack = rewritten.as_deref().unwrap_or(&chunk[..]);
            let replaced = match pattern.replace_all(haystack, replacement) {
                Cow::Owned(out) => Some(out),
                Cow::Borrowed(_) => None,
            };
            if replaced.is_some() {
                rewritten = replaced;
            }
        }

        match rewritten {
            Some(data) => Disposition::Forward(Bytes::from(data)),
            None => Disposition::Forward(chunk),
        }
    }
}
