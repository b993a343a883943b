//! Token estimation for context metrics.
//!
//! Encoders are resolved per model name through `tiktoken-rs` and memoized,
//! including misses, so an unknown model pays the lookup only once. Models
//! without a known encoder fall back to `chars / 3.7 + 1`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tiktoken_rs::CoreBPE;

use crate::models::BlockStats;

/// Shared, read-mostly token counter keyed by model name.
#[derive(Default)]
pub struct TokenEstimator {
    encoders: RwLock<HashMap<String, Option<Arc<CoreBPE>>>>,
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    fn encoder(&self, model: &str) -> Option<Arc<CoreBPE>> {
        if let Ok(cache) = self.encoders.read() {
            if let Some(cached) = cache.get(model) {
                return cached.clone();
            }
        }

        let resolved = tiktoken_rs::get_bpe_from_model(model).ok().map(Arc::new);
        if resolved.is_none() {
            tracing::debug!(model, "no tokenizer for model, using approximation");
        }
        if let Ok(mut cache) = self.encoders.write() {
            cache
                .entry(model.to_string())
                .or_insert_with(|| resolved.clone());
        }
        resolved
    }

    /// Estimated token count of `text` for `model`. Empty text is 0 tokens.
    pub fn estimate(&self, text: &str, model: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.encoder(model) {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => approximate_tokens(text),
        }
    }

    /// Character and token totals over a group of blocks.
    pub fn summarize<S: AsRef<str>>(&self, blocks: &[S], model: &str) -> BlockStats {
        blocks.iter().fold(
            BlockStats {
                blocks: blocks.len(),
                ..BlockStats::default()
            },
            |mut stats, block| {
                let text = block.as_ref();
                stats.chars += text.chars().count();
                stats.tokens += self.estimate(text, model);
                stats
            },
        )
    }
}

fn approximate_tokens(text: &str) -> usize {
    (text.chars().count() as f64 / 3.7) as usize + 1
}
