pub mod session;

pub use session::ConversationStore;

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RewriteConfig;
use crate::llm::{LlmProviderManager, Message};
use crate::models::{ConversationRole, ConversationTurn, RewriteResult};

/// Rewritten queries longer than this are truncated.
const MAX_REWRITTEN_CHARS: usize = 512;

/// Variants at or above this normalized similarity to the primary rewrite
/// are dropped as near-duplicates.
const VARIANT_SIMILARITY_CUTOFF: f64 = 0.95;

/// Transforms a follow-up query plus recent conversation history into a
/// self-contained query and a small set of paraphrastic variants.
///
/// Pure apart from the resilient LLM call; any LLM or parse failure degrades
/// to the identity rewrite with confidence 0.
pub struct QueryRewriter {
    llm: Arc<LlmProviderManager>,
    config: RewriteConfig,
    sessions: ConversationStore,
}

#[derive(Deserialize)]
struct LlmRewrite {
    rewritten: String,
    #[serde(default)]
    variants: Vec<String>,
    #[serde(default)]
    confidence: f64,
}

impl QueryRewriter {
    pub fn new(llm: Arc<LlmProviderManager>, config: RewriteConfig) -> Self {
        Self {
            llm,
            config,
            sessions: ConversationStore::new(),
        }
    }

    pub fn sessions(&self) -> &ConversationStore {
        &self.sessions
    }

    /// Record a finished turn into the conversation ring.
    pub fn record_turn(&self, conversation_id: &str, turn: ConversationTurn) {
        self.sessions.record(conversation_id, turn);
    }

    /// Rewrite using the stored history of a conversation.
    pub async fn rewrite_for_conversation(
        &self,
        query: &str,
        conversation_id: &str,
    ) -> RewriteResult {
        let history = self
            .sessions
            .history(conversation_id, self.config.max_history_turns);
        self.rewrite(query, &history).await
    }

    /// Rewrite a query against explicit history. With empty history this is
    /// the identity with confidence 1.
    pub async fn rewrite(&self, query: &str, history: &[ConversationTurn]) -> RewriteResult {
        if history.is_empty() {
            return RewriteResult::identity(query, 1.0);
        }

        let window_start = history.len().saturating_sub(self.config.max_history_turns);
        let window = &history[window_start..];
        let prompt = self.build_prompt(query, window);

        let outcome = self
            .llm
            .generate(None, &[Message::user(prompt)], Some(512), Some(0.0))
            .await;

        let raw = match outcome {
            Ok(result) => result.content,
            Err(err) => {
                warn!("query rewrite degraded to identity: {err}");
                return RewriteResult::identity(query, 0.0);
            }
        };

        match parse_rewrite(&raw) {
            Some(parsed) => self.sanitize(query, parsed),
            None => {
                warn!("query rewrite response unparseable, using identity");
                debug!("unparseable rewrite payload: {raw}");
                RewriteResult::identity(query, 0.0)
            }
        }
    }

    fn build_prompt(&self, query: &str, history: &[ConversationTurn]) -> String {
        let history_text = history
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    ConversationRole::User => "user",
                    ConversationRole::Assistant => "assistant",
                };
                format!("{role}: {}", turn.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let entities = extract_entities(history);
        let entity_hint = if entities.is_empty() {
            String::new()
        } else {
            format!(
                "Named entities mentioned so far: {}.\n",
                entities.join(", ")
            )
        };

        let max_variations = if self.config.enable_expansion {
            self.config.max_variations
        } else {
            0
        };

        format!(
            "Rewrite the user's latest question as a single self-contained question. \
             Resolve pronouns (it, they, this, 它, 这个, ...) using the named entities \
             from the conversation. Do not answer the question.\n\
             {entity_hint}\
             Also produce up to {max_variations} paraphrased variants that widen recall.\n\
             Respond with JSON only: {{\"rewritten\": string, \"variants\": [string], \
             \"confidence\": number between 0 and 1}}\n\n\
             Conversation:\n{history_text}\n\n\
             Latest question: {query}"
        )
    }

    fn sanitize(&self, query: &str, parsed: LlmRewrite) -> RewriteResult {
        let mut rewritten: String = parsed.rewritten.trim().to_string();
        if rewritten.is_empty() {
            return RewriteResult::identity(query, 0.0);
        }
        if rewritten.chars().count() > MAX_REWRITTEN_CHARS {
            rewritten = rewritten.chars().take(MAX_REWRITTEN_CHARS).collect();
        }

        let mut variants: Vec<String> = Vec::new();
        for variant in parsed.variants {
            let variant = variant.trim().to_string();
            if variant.is_empty() || variant == rewritten {
                continue;
            }
            if normalized_similarity(&variant, &rewritten) >= VARIANT_SIMILARITY_CUTOFF {
                continue;
            }
            if variants.iter().any(|v| v == &variant) {
                continue;
            }
            variants.push(variant);
            if variants.len() >= self.config.max_variations {
                break;
            }
        }
        if !self.config.enable_expansion {
            variants.clear();
        }

        RewriteResult {
            original: query.to_string(),
            rewritten,
            variants,
            confidence: parsed.confidence.clamp(0.0, 1.0),
        }
    }
}

/// Parse the model's JSON reply, tolerating markdown code fences.
fn parse_rewrite(raw: &str) -> Option<LlmRewrite> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    serde_json::from_str(body).ok()
}

/// Crude named-entity extraction from history: capitalized latin words that
/// are not sentence-leading stop-ish words, plus CJK noun runs of 2+ chars.
/// Used only to anchor the rewrite prompt.
pub fn extract_entities(history: &[ConversationTurn]) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();
    for turn in history {
        for token in turn.content.split(|c: char| !c.is_alphanumeric()) {
            if token.len() < 2 {
                continue;
            }
            let mut chars = token.chars();
            let first = chars.next().unwrap_or(' ');
            if first.is_uppercase() && !COMMON_CAPITALIZED.contains(&token) {
                if !entities.iter().any(|e| e == token) {
                    entities.push(token.to_string());
                }
            }
        }
        // CJK runs of two or more characters.
        let mut run = String::new();
        for c in turn.content.chars() {
            if ('\u{4e00}'..='\u{9fff}').contains(&c) {
                run.push(c);
            } else {
                if run.chars().count() >= 2 && !entities.iter().any(|e| e == &run) {
                    entities.push(run.clone());
                }
                run.clear();
            }
        }
        if run.chars().count() >= 2 && !entities.iter().any(|e| e == &run) {
            entities.push(run);
        }
    }
    entities.truncate(8);
    entities
}

const COMMON_CAPITALIZED: &[&str] = &[
    "The", "This", "That", "What", "When", "Where", "Which", "Who", "Why", "How", "Is", "Are",
    "Can", "Could", "Please", "Yes", "No", "It", "They", "We", "You",
];

/// Levenshtein-based similarity normalized to [0, 1].
pub fn normalized_similarity(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let max_len = a_chars.len().max(b_chars.len());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein(&a_chars, &b_chars);
    1.0 - distance as f64 / max_len as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResilienceConfig, ResilienceSection};
    use crate::llm::{CompletionModel, CompletionResult};
    use crate::resilience::DegradationManager;
    use async_trait::async_trait;

    struct CannedLlm {
        reply: Option<String>,
    }

    #[async_trait]
    impl CompletionModel for CannedLlm {
        async fn complete(
            &self,
            _messages: &[Message],
            _max_tokens: Option<u32>,
            _temperature: Option<f64>,
        ) -> anyhow::Result<CompletionResult> {
            match &self.reply {
                Some(reply) => Ok(CompletionResult {
                    content: reply.clone(),
                    usage: None,
                    provider: String::new(),
                }),
                None => anyhow::bail!("llm down"),
            }
        }

        async fn complete_stream(
            &self,
            _messages: &[Message],
            _max_tokens: Option<u32>,
            _temperature: Option<f64>,
        ) -> anyhow::Result<tokio::sync::mpsc::Receiver<String>> {
            anyhow::bail!("not used")
        }
    }

    fn rewriter(reply: Option<&str>) -> QueryRewriter {
        let section = ResilienceSection {
            default: ResilienceConfig {
                max_retries: Some(0),
                base_delay_s: Some(0.001),
                jitter: Some(0.0),
                timeout_s: Some(5.0),
                ..Default::default()
            },
            services: Default::default(),
        };
        let manager = LlmProviderManager::new(
            vec![(
                "mock".to_string(),
                Arc::new(CannedLlm {
                    reply: reply.map(String::from),
                }) as Arc<dyn CompletionModel>,
            )],
            &section,
            Arc::new(DegradationManager::new()),
        );
        QueryRewriter::new(Arc::new(manager), RewriteConfig::default())
    }

    fn history() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::user("Introduce OpenAI"),
            ConversationTurn::assistant("OpenAI is an AI company based in San Francisco."),
        ]
    }

    #[tokio::test]
    async fn test_empty_history_is_identity() {
        let rewriter = rewriter(Some("ignored"));
        let result = rewriter.rewrite("What are its products?", &[]).await;
        assert_eq!(result.rewritten, "What are its products?");
        assert!(result.variants.is_empty());
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_pronoun_resolution_via_llm() {
        let rewriter = rewriter(Some(
            r#"{"rewritten": "What are OpenAI's products?",
                "variants": ["Which products does OpenAI offer?", "OpenAI product lineup"],
                "confidence": 0.9}"#,
        ));
        let result = rewriter.rewrite("What are its products?", &history()).await;
        assert!(result.rewritten.contains("OpenAI"));
        assert!(result.confidence > 0.5);
        assert!(result.variants.len() <= 3);
    }

    #[tokio::test]
    async fn test_llm_failure_degrades_to_identity() {
        let rewriter = rewriter(None);
        let result = rewriter.rewrite("What are its products?", &history()).await;
        assert_eq!(result.rewritten, "What are its products?");
        assert_eq!(result.confidence, 0.0);
        assert!(result.variants.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_reply_degrades_to_identity() {
        let rewriter = rewriter(Some("Sure! Here is a rewrite: ..."));
        let result = rewriter.rewrite("What are its products?", &history()).await;
        assert_eq!(result.rewritten, "What are its products?");
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_code_fenced_json_parses() {
        let rewriter = rewriter(Some(
            "```json\n{\"rewritten\": \"What are OpenAI's products?\", \"variants\": [], \"confidence\": 0.8}\n```",
        ));
        let result = rewriter.rewrite("What are its products?", &history()).await;
        assert!(result.rewritten.contains("OpenAI"));
    }

    #[tokio::test]
    async fn test_near_duplicate_variants_dropped() {
        let rewriter = rewriter(Some(
            r#"{"rewritten": "What are OpenAI's products?",
                "variants": ["What are OpenAI's products!", "Totally different phrasing"],
                "confidence": 0.7}"#,
        ));
        let result = rewriter.rewrite("q", &history()).await;
        assert_eq!(result.variants, vec!["Totally different phrasing".to_string()]);
    }

    #[tokio::test]
    async fn test_overlong_rewrite_truncated() {
        let long = "x".repeat(600);
        let reply = format!(r#"{{"rewritten": "{long}", "variants": [], "confidence": 1.5}}"#);
        let rewriter = rewriter(Some(reply.as_str()));
        let result = rewriter.rewrite("q", &history()).await;
        assert_eq!(result.rewritten.chars().count(), 512);
        // Confidence clamped to [0, 1].
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_extract_entities() {
        let entities = extract_entities(&history());
        assert!(entities.contains(&"OpenAI".to_string()));
        assert!(!entities.contains(&"is".to_string()));
    }

    #[test]
    fn test_normalized_similarity() {
        assert_eq!(normalized_similarity("abc", "abc"), 1.0);
        assert!(normalized_similarity("abcd", "abce") >= 0.75);
        assert!(normalized_similarity("abc", "xyz") < 0.5);
    }
}
