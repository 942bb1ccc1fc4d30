use std::sync::atomic::{AtomicU64, Ordering};

/// Serves reduced answers when every upstream is down. Stateless apart from
/// counters surfaced in the registry status.
#[derive(Debug, Default)]
pub struct DegradationManager {
    degraded_searches: AtomicU64,
    degraded_completions: AtomicU64,
}

/// Canned completion returned when every LLM provider is open or failing.
pub const FALLBACK_COMPLETION: &str = "The assistant is temporarily unavailable. \
Please retry in a moment. In the meantime you can: \
search the knowledge base directly, or contact a human operator.";

impl DegradationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a retrieval request served with a reduced pipeline and return
    /// the status string attached to the response.
    pub fn degraded_search(&self, reason: &str) -> String {
        self.degraded_searches.fetch_add(1, Ordering::Relaxed);
        format!("degraded: {reason}")
    }

    /// Canned text for a completion when all providers are unavailable.
    pub fn degraded_completion(&self) -> String {
        self.degraded_completions.fetch_add(1, Ordering::Relaxed);
        FALLBACK_COMPLETION.to_string()
    }

    pub fn degraded_search_count(&self) -> u64 {
        self.degraded_searches.load(Ordering::Relaxed)
    }

    pub fn degraded_completion_count(&self) -> u64 {
        self.degraded_completions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_status() {
        let manager = DegradationManager::new();
        let status = manager.degraded_search("dense retrieval unavailable");
        assert!(status.contains("dense retrieval unavailable"));
        assert_eq!(manager.degraded_search_count(), 1);

        let text = manager.degraded_completion();
        assert!(text.contains("knowledge base"));
        assert!(text.contains("human operator"));
        assert_eq!(manager.degraded_completion_count(), 1);
    }
}
