//! Token Optimizer
//!
//! Runs text through a pipeline of size-reducing transforms and memoizes
//! the result in a [`ResultCache`]. Savings are estimated in tokens using
//! the common four-characters-per-token heuristic.

use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use serde::Serialize;
use serde_json::{json, Value};

use super::cache::{cache_key, ResultCache};

/// Estimates the token count of a text (`ceil(chars / 4)`).
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

/// A single text transformation in the optimizer pipeline.
pub trait Transform: Send + Sync {
    /// Stable name, part of the cache key.
    fn name(&self) -> &str;

    fn apply(&self, input: &str) -> String;
}

/// Removes whitespace at the end of every line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimTrailingWhitespace;

impl Transform for TrimTrailingWhitespace {
    fn name(&self) -> &str {
        "trim_trailing"
    }

    fn apply(&self, input: &str) -> String {
        input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
    }
}

/// Collapses runs of blank lines into a single blank line.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollapseBlankLines;

impl Transform for CollapseBlankLines {
    fn name(&self) -> &str {
        "collapse_blank_lines"
    }

    fn apply(&self, input: &str) -> String {
        let mut lines = Vec::new();
        let mut previous_blank = false;

        for line in input.lines() {
            let blank = line.trim().is_empty();
            if blank && previous_blank {
                continue;
            }
            previous_blank = blank;
            lines.push(line);
        }

        lines.join("\n")
    }
}

/// Collapses runs of spaces and tabs inside a line, keeping indentation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollapseInlineWhitespace;

impl Transform for CollapseInlineWhitespace {
    fn name(&self) -> &str {
        "collapse_inline_whitespace"
    }

    fn apply(&self, input: &str) -> String {
        input
            .lines()
            .map(|line| {
                let body = line.trim_start();
                let indent = &line[..line.len() - body.len()];
                let words: Vec<&str> = body.split([' ', '\t']).filter(|w| !w.is_empty()).collect();
                format!("{}{}", indent, words.join(" "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Result of one [`Optimizer::optimize`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Optimized {
    pub output: String,
    pub cache_hit: bool,
    pub original_tokens: usize,
    pub optimized_tokens: usize,
}

impl Optimized {
    /// Tokens saved by this call.
    pub fn saved_tokens(&self) -> usize {
        self.original_tokens.saturating_sub(self.optimized_tokens)
    }
}

/// Cumulative savings of an optimizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Savings {
    /// Pipeline runs (cache misses)
    pub runs: u64,
    pub cache_hits: u64,
    pub tokens_saved: u64,
    pub bytes_saved: u64,
}

/// Memoizing text optimizer shared by executors through the step context.
pub struct Optimizer {
    cache: Arc<ResultCache>,
    pipeline: Vec<Box<dyn Transform>>,
    savings: Mutex<Savings>,
}

impl Optimizer {
    /// Creates an optimizer with the built-in whitespace pipeline.
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self::with_pipeline(
            cache,
            vec![
                Box::new(TrimTrailingWhitespace),
                Box::new(CollapseBlankLines),
                Box::new(CollapseInlineWhitespace),
            ],
        )
    }

    /// Creates an optimizer with a custom pipeline.
    pub fn with_pipeline(cache: Arc<ResultCache>, pipeline: Vec<Box<dyn Transform>>) -> Self {
        Self {
            cache,
            pipeline,
            savings: Mutex::new(Savings::default()),
        }
    }

    /// The cache backing this optimizer.
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Names of the transforms, in application order.
    pub fn pipeline(&self) -> Vec<&str> {
        self.pipeline.iter().map(|t| t.name()).collect()
    }

    /// Optimizes `input`, serving repeated inputs from the cache.
    pub fn optimize(&self, input: &str) -> Optimized {
        let key = cache_key(&json!({
            "pipeline": self.pipeline(),
            "input": input,
        }));
        let original_tokens = estimate_tokens(input);

        if let Some(Value::String(output)) = self.cache.get(&key) {
            self.lock_savings().cache_hits += 1;
            return Optimized {
                optimized_tokens: estimate_tokens(&output),
                output,
                cache_hit: true,
                original_tokens,
            };
        }

        let output = self
            .pipeline
            .iter()
            .fold(input.to_string(), |text, transform| transform.apply(&text));
        let optimized_tokens = estimate_tokens(&output);

        {
            let mut savings = self.lock_savings();
            savings.runs += 1;
            savings.tokens_saved += original_tokens.saturating_sub(optimized_tokens) as u64;
            savings.bytes_saved += input.len().saturating_sub(output.len()) as u64;
        }

        debug!(
            "Optimized {} -> {} tokens ({} transforms)",
            original_tokens,
            optimized_tokens,
            self.pipeline.len()
        );

        self.cache.set(key, Value::String(output.clone()));

        Optimized {
            output,
            cache_hit: false,
            original_tokens,
            optimized_tokens,
        }
    }

    /// Cumulative savings since creation.
    pub fn savings(&self) -> Savings {
        *self.lock_savings()
    }

    fn lock_savings(&self) -> std::sync::MutexGuard<'_, Savings> {
        self.savings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimizer")
            .field("pipeline", &self.pipeline())
            .field("savings", &self.savings())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> Optimizer {
        Optimizer::new(Arc::new(ResultCache::new(8)))
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_trim_trailing() {
        assert_eq!(TrimTrailingWhitespace.apply("a  \nb\t\n"), "a\nb");
    }

    #[test]
    fn test_collapse_blank_lines() {
        assert_eq!(CollapseBlankLines.apply("a\n\n\n  \nb\n\nc"), "a\n\nb\n\nc");
    }

    #[test]
    fn test_collapse_inline_keeps_indent() {
        assert_eq!(
            CollapseInlineWhitespace.apply("    let  x =\t\t1;\nfoo   bar"),
            "    let x = 1;\nfoo bar"
        );
    }

    #[test]
    fn test_optimize_miss_then_hit() {
        let optimizer = optimizer();
        let input = "Hello     world   \n\n\n\nSecond    line   ";

        let first = optimizer.optimize(input);
        assert!(!first.cache_hit);
        assert_eq!(first.output, "Hello world\n\nSecond line");
        assert!(first.saved_tokens() > 0);

        let second = optimizer.optimize(input);
        assert!(second.cache_hit);
        assert_eq!(second.output, first.output);

        let savings = optimizer.savings();
        assert_eq!(savings.runs, 1);
        assert_eq!(savings.cache_hits, 1);
        assert_eq!(savings.tokens_saved, first.saved_tokens() as u64);
        assert_eq!(savings.bytes_saved, (input.len() - first.output.len()) as u64);
    }

    #[test]
    fn test_whitespace_variants_cached_separately() {
        let optimizer = optimizer();
        let a = optimizer.optimize("x\n\n\ny");
        let b = optimizer.optimize("x y");

        assert!(!b.cache_hit);
        assert_ne!(a.output, b.output);
    }

    #[test]
    fn test_custom_pipeline() {
        struct Upper;
        impl Transform for Upper {
            fn name(&self) -> &str {
                "upper"
            }
            fn apply(&self, input: &str) -> String {
                input.to_uppercase()
            }
        }

        let optimizer = Optimizer::with_pipeline(Arc::new(ResultCache::new(2)), vec![Box::new(Upper)]);
        assert_eq!(optimizer.pipeline(), vec!["upper"]);
        assert_eq!(optimizer.optimize("abc").output, "ABC");
    }
}
