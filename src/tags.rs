//! Retrieval keyword extraction.
//!
//! Tags come from a punctuation split of the question, optionally extended
//! by one model call. The merged list is deduplicated case-insensitively in
//! first-seen order and capped at [`MAX_TAGS`].

use std::collections::HashSet;
use std::sync::Arc;

use crate::model::{ChatMessage, ChatModel};
use crate::models::{truncate_chars, MAX_TAGS};

const MAX_TAG_CHARS: usize = 40;

const TAG_PROMPT: &str = "Extract 3-8 retrieval keywords or short phrases from the question. \
Output them comma-separated and nothing else. Keep proper nouns exactly as written.";

fn is_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | '，' | '.' | '。' | ';' | '；' | ':' | '：' | '/')
}

/// Split a question into candidate tags without consulting a model.
pub fn heuristic_tags(question: &str) -> Vec<String> {
    question
        .split(is_separator)
        .filter(|t| {
            let len = t.chars().count();
            len > 1 && len <= MAX_TAG_CHARS
        })
        .take(MAX_TAGS)
        .map(str::to_string)
        .collect()
}

/// Merge candidate lists, dropping case-insensitive duplicates.
pub fn merge_tags<I>(candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let mut tags = Vec::new();
    for tag in candidates {
        if tags.len() >= MAX_TAGS {
            break;
        }
        if seen.insert(tag.to_lowercase()) {
            tags.push(tag);
        }
    }
    tags
}

/// Produces the tag set used by every retrieval call of a question.
pub struct TagExtractor {
    model: Option<Arc<dyn ChatModel>>,
}

impl TagExtractor {
    pub fn new(model: Option<Arc<dyn ChatModel>>) -> Self {
        Self { model }
    }

    /// Extract tags. Empty iff the question is empty or whitespace-only.
    pub async fn extract(&self, question: &str) -> Vec<String> {
        let base = question.trim();
        if base.is_empty() {
            return Vec::new();
        }

        let mut candidates = heuristic_tags(base);

        if let Some(model) = &self.model {
            let messages = [ChatMessage::system(TAG_PROMPT), ChatMessage::human(base)];
            match model.invoke(&messages).await {
                Ok(reply) => candidates.extend(
                    reply
                        .replace('\n', " ")
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string),
                ),
                Err(e) => tracing::debug!(error = %e, "tag refinement failed"),
            }
        }

        if candidates.is_empty() {
            candidates.push(truncate_chars(base, MAX_TAG_CHARS).to_string());
        }
        merge_tags(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixedReply(&'static str);

    #[async_trait]
    impl ChatModel for FixedReply {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn invoke(&self, _messages: &[ChatMessage]) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl ChatModel for Failing {
        fn model_name(&self) -> &str {
            "failing"
        }

        async fn invoke(&self, _messages: &[ChatMessage]) -> Result<String> {
            anyhow::bail!("connection refused")
        }
    }

    fn assert_tag_invariants(tags: &[String]) {
        assert!(tags.len() <= MAX_TAGS);
        let lowered: HashSet<String> = tags.iter().map(|t| t.to_lowercase()).collect();
        assert_eq!(lowered.len(), tags.len());
    }

    #[test]
    fn test_heuristic_split_and_length_filter() {
        let tags = heuristic_tags("Q3 revenue, by category；统计/数据 a");
        assert_eq!(tags, vec!["Q3", "revenue", "by", "category", "统计", "数据"]);
    }

    #[test]
    fn test_heuristic_drops_overlong_tokens() {
        let long = "x".repeat(41);
        assert!(heuristic_tags(&long).is_empty());
        assert_eq!(heuristic_tags(&"y".repeat(40)).len(), 1);
    }

    #[test]
    fn test_merge_dedupes_case_insensitively() {
        let tags = merge_tags(
            ["Revenue", "revenue", "REVENUE", "Sales"]
                .into_iter()
                .map(String::from),
        );
        assert_eq!(tags, vec!["Revenue", "Sales"]);
    }

    #[tokio::test]
    async fn test_empty_question_yields_no_tags() {
        let extractor = TagExtractor::new(Some(Arc::new(FixedReply("a, b"))));
        assert!(extractor.extract("").await.is_empty());
        assert!(extractor.extract("   \n\t").await.is_empty());
    }

    #[tokio::test]
    async fn test_model_terms_are_appended_and_capped() {
        let extractor = TagExtractor::new(Some(Arc::new(FixedReply(
            "revenue, Q3 revenue, k1, k2, k3, k4, k5, k6, k7, k8, k9, k10",
        ))));
        let tags = extractor.extract("quarterly revenue report").await;
        assert_eq!(tags[..3], ["quarterly", "revenue", "report"]);
        assert_eq!(tags[3], "Q3 revenue");
        assert_tag_invariants(&tags);
        assert_eq!(tags.len(), MAX_TAGS);
    }

    #[tokio::test]
    async fn test_model_failure_keeps_heuristic_tags() {
        let extractor = TagExtractor::new(Some(Arc::new(Failing)));
        let tags = extractor.extract("sales by region").await;
        assert_eq!(tags, vec!["sales", "by", "region"]);
    }

    #[tokio::test]
    async fn test_single_char_question_still_tagged() {
        let extractor = TagExtractor::new(None);
        assert_eq!(extractor.extract(" 税 ").await, vec!["税"]);
    }

    #[tokio::test]
    async fn test_invariants_hold_for_varied_questions() {
        let extractor = TagExtractor::new(None);
        for q in [
            "a",
            "What, what; WHAT: What/what",
            "一 二 三 四 五 六 七 八 九 十 十一 十二 十三 十四 十五",
            &"word ".repeat(50),
        ] {
            let tags = extractor.extract(q).await;
            assert!(!tags.is_empty());
            assert_tag_invariants(&tags);
        }
    }
}
