use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tracing::{info, warn};

use crate::config::ResilienceSection;
use crate::error::{classify_backend, CoreError, CoreResult};
use crate::resilience::{BreakerSnapshot, DegradationManager, ResiliencePolicy};

use super::{CompletionModel, CompletionResult, Message};

struct Provider {
    key: String,
    model: Arc<dyn CompletionModel>,
    policy: ResiliencePolicy,
}

/// Routes completion calls across a closed set of providers in static
/// priority order. Each provider has its own breaker; a provider failure
/// opens only that provider's circuit. When every provider fails or is open,
/// the degradation manager supplies a canned response.
pub struct LlmProviderManager {
    providers: Vec<Provider>,
    degradation: Arc<DegradationManager>,
}

impl LlmProviderManager {
    /// `providers` must be in priority order.
    pub fn new(
        providers: Vec<(String, Arc<dyn CompletionModel>)>,
        resilience: &ResilienceSection,
        degradation: Arc<DegradationManager>,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|(key, model)| {
                let service = format!("llm.{key}");
                let policy = ResiliencePolicy::new(&service, &resilience.for_service(&service));
                Provider { key, model, policy }
            })
            .collect();
        Self {
            providers,
            degradation,
        }
    }

    pub fn provider_keys(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.key.clone()).collect()
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.providers
            .iter()
            .map(|p| p.policy.breaker().snapshot())
            .collect()
    }

    pub fn reset_circuit(&self, provider_key: &str) -> bool {
        match self.providers.iter().find(|p| p.key == provider_key) {
            Some(provider) => {
                provider.policy.breaker().reset();
                true
            }
            None => false,
        }
    }

    /// Providers in attempt order: the preferred one first, then the rest by
    /// priority.
    fn ordered(&self, preferred: Option<&str>) -> Vec<&Provider> {
        let mut ordered: Vec<&Provider> = Vec::with_capacity(self.providers.len());
        if let Some(key) = preferred {
            if let Some(p) = self.providers.iter().find(|p| p.key == key) {
                ordered.push(p);
            }
        }
        for p in &self.providers {
            if !ordered.iter().any(|q| q.key == p.key) {
                ordered.push(p);
            }
        }
        ordered
    }

    /// Generate a completion, failing over across providers. Errors with
    /// `ServiceUnavailable` only when every provider failed or was open.
    pub async fn generate(
        &self,
        preferred: Option<&str>,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> CoreResult<CompletionResult> {
        if self.providers.is_empty() {
            return Err(CoreError::ServiceUnavailable("no LLM providers configured".into()));
        }

        let mut last_error: Option<CoreError> = None;
        for provider in self.ordered(preferred) {
            let service = format!("llm.{}", provider.key);
            let outcome = provider
                .policy
                .call(|| async {
                    provider
                        .model
                        .complete(messages, max_tokens, temperature)
                        .await
                        .map_err(|e| classify_backend(&service, e))
                })
                .await;

            match outcome {
                Ok(mut result) => {
                    result.provider = provider.key.clone();
                    return Ok(result);
                }
                Err(CoreError::CircuitOpen(_)) => {
                    info!("provider {} skipped: circuit open", provider.key);
                    last_error = Some(CoreError::CircuitOpen(service));
                }
                Err(err) => {
                    warn!("provider {} failed: {err}", provider.key);
                    last_error = Some(err);
                }
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no providers attempted".to_string());
        Err(CoreError::ServiceUnavailable(format!(
            "all LLM providers unavailable (last: {detail})"
        )))
    }

    /// Like `generate`, but never fails: when every provider is down, returns
    /// the degradation manager's canned response.
    pub async fn generate_with_fallback(
        &self,
        preferred: Option<&str>,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> CompletionResult {
        match self.generate(preferred, messages, max_tokens, temperature).await {
            Ok(result) => result,
            Err(err) => {
                warn!("serving degraded completion: {err}");
                CompletionResult {
                    content: self.degradation.degraded_completion(),
                    usage: None,
                    provider: String::new(),
                }
            }
        }
    }

    /// Start a streaming completion on the first available provider.
    pub async fn generate_stream(
        &self,
        preferred: Option<&str>,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: Option<f64>,
    ) -> CoreResult<Receiver<String>> {
        let mut last_error: Option<CoreError> = None;
        for provider in self.ordered(preferred) {
            let service = format!("llm.{}", provider.key);
            let outcome = provider
                .policy
                .call(|| async {
                    provider
                        .model
                        .complete_stream(messages, max_tokens, temperature)
                        .await
                        .map_err(|e| classify_backend(&service, e))
                })
                .await;
            match outcome {
                Ok(rx) => return Ok(rx),
                Err(err) => {
                    warn!("provider {} stream failed: {err}", provider.key);
                    last_error = Some(err);
                }
            }
        }
        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no providers configured".to_string());
        Err(CoreError::ServiceUnavailable(format!(
            "all LLM providers unavailable (last: {detail})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::resilience::CircuitState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedModel {
        fail_first: u32,
        calls: AtomicU32,
        reply: String,
    }

    #[async_trait]
    impl CompletionModel for ScriptedModel {
        async fn complete(
            &self,
            _messages: &[Message],
            _max_tokens: Option<u32>,
            _temperature: Option<f64>,
        ) -> anyhow::Result<CompletionResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("simulated transient failure");
            }
            Ok(CompletionResult {
                content: self.reply.clone(),
                usage: None,
                provider: String::new(),
            })
        }

        async fn complete_stream(
            &self,
            _messages: &[Message],
            _max_tokens: Option<u32>,
            _temperature: Option<f64>,
        ) -> anyhow::Result<Receiver<String>> {
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            let reply = self.reply.clone();
            tokio::spawn(async move {
                let _ = tx.send(reply).await;
            });
            Ok(rx)
        }
    }

    fn section() -> ResilienceSection {
        ResilienceSection {
            default: ResilienceConfig {
                max_retries: Some(2),
                base_delay_s: Some(0.001),
                max_delay_s: Some(0.002),
                jitter: Some(0.0),
                failure_threshold: Some(5),
                timeout_s: Some(5.0),
                ..Default::default()
            },
            services: Default::default(),
        }
    }

    fn manager(providers: Vec<(&str, u32, &str)>) -> LlmProviderManager {
        let providers = providers
            .into_iter()
            .map(|(key, fail_first, reply)| {
                (
                    key.to_string(),
                    Arc::new(ScriptedModel {
                        fail_first,
                        calls: AtomicU32::new(0),
                        reply: reply.to_string(),
                    }) as Arc<dyn CompletionModel>,
                )
            })
            .collect();
        LlmProviderManager::new(providers, &section(), Arc::new(DegradationManager::new()))
    }

    #[tokio::test]
    async fn test_failover_to_second_provider() {
        // A fails more times than its retry budget; B answers.
        let manager = manager(vec![("a", 10, "from-a"), ("b", 0, "from-b")]);
        let result = manager
            .generate(None, &[Message::user("hi")], None, None)
            .await
            .unwrap();
        assert_eq!(result.content, "from-b");
        assert_eq!(result.provider, "b");

        let snapshots = manager.breaker_snapshots();
        let a = snapshots.iter().find(|s| s.service == "llm.a").unwrap();
        let b = snapshots.iter().find(|s| s.service == "llm.b").unwrap();
        assert!(a.consecutive_failures >= 1);
        assert_eq!(b.state, CircuitState::Closed);
        assert_eq!(b.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_preferred_provider_first() {
        let manager = manager(vec![("a", 0, "from-a"), ("b", 0, "from-b")]);
        let result = manager
            .generate(Some("b"), &[Message::user("hi")], None, None)
            .await
            .unwrap();
        assert_eq!(result.provider, "b");
    }

    #[tokio::test]
    async fn test_all_down_yields_service_unavailable() {
        let manager = manager(vec![("a", 100, ""), ("b", 100, "")]);
        let result = manager.generate(None, &[Message::user("hi")], None, None).await;
        assert!(matches!(result, Err(CoreError::ServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_fallback_returns_canned_response() {
        let manager = manager(vec![("a", 100, "")]);
        let result = manager
            .generate_with_fallback(None, &[Message::user("hi")], None, None)
            .await;
        assert!(result.content.contains("human operator"));
        assert!(result.provider.is_empty());
    }

    #[tokio::test]
    async fn test_open_circuit_skipped() {
        let manager = manager(vec![("a", 0, "from-a"), ("b", 0, "from-b")]);
        // Force A open; traffic should flow to B without errors.
        manager.providers[0].policy.breaker().force_open();
        let result = manager
            .generate(None, &[Message::user("hi")], None, None)
            .await
            .unwrap();
        assert_eq!(result.provider, "b");
    }
}
