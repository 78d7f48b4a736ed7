use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CodegenConfig;
use crate::error::GenerationError;
use crate::models::StrategyConfig;
use crate::refinement::analysis::Suggestion;
use crate::strategy::template;

/// Structured feedback from the previous iteration's analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub iteration: u32,
    pub issues: Vec<String>,
    pub suggestions: Vec<Suggestion>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub description: String,
    #[serde(default)]
    pub feedback: Option<Feedback>,
    /// Values the returned config must carry unchanged.
    #[serde(default)]
    pub protected_parameters: BTreeMap<String, f64>,
    #[serde(default)]
    pub previous_config: Option<StrategyConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedStrategy {
    pub code: String,
    pub config: StrategyConfig,
}

/// The external code-generation collaborator.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedStrategy, GenerationError>;
}

/// Shape of the `config` the service is expected to return.
pub fn config_schema() -> Value {
    json!({
        "type": "object",
        "required": ["symbols", "indicators", "entry_conditions"],
        "properties": {
            "name": {"type": "string"},
            "symbols": {"type": "array", "items": {"type": "string"}},
            "indicators": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "kind": {"enum": ["rsi", "sma", "ema", "roc", "stddev"]},
                        "period": {"type": "integer", "minimum": 1}
                    }
                }
            },
            "entry_conditions": {"type": "array"},
            "exit_conditions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "fractional_exit": {"type": "number", "exclusiveMinimum": 0, "maximum": 1}
                    }
                }
            },
            "parameters": {
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "properties": {
                        "value": {"type": "number"},
                        "protected": {"type": "boolean"}
                    }
                }
            },
            "rebalance_every": {"type": "integer", "minimum": 1}
        }
    })
}

#[derive(Debug, Serialize)]
struct HttpBody<'a> {
    description: &'a str,
    feedback: Option<&'a Feedback>,
    protected_parameters: &'a BTreeMap<String, f64>,
    previous_config: Option<&'a StrategyConfig>,
    schema: Value,
}

/// POSTs the request as JSON and expects `{code, config}` back.
pub struct HttpCodeGenerator {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpCodeGenerator {
    pub fn new(endpoint: &str, cfg: &CodegenConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: cfg.api_key.clone(),
        }
    }
}

fn classify_status(status: StatusCode, body: String) -> GenerationError {
    let reason = format!("{}: {}", status.as_u16(), body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        GenerationError::Transient { reason }
    } else {
        GenerationError::Rejected { reason }
    }
}

#[async_trait]
impl CodeGenerator for HttpCodeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedStrategy, GenerationError> {
        let body = HttpBody {
            description: &request.description,
            feedback: request.feedback.as_ref(),
            protected_parameters: &request.protected_parameters,
            previous_config: request.previous_config.as_ref(),
            schema: config_schema(),
        };

        let mut req = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req.send().await.map_err(|e| GenerationError::Transient {
            reason: e.to_string(),
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| GenerationError::Transient {
            reason: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(classify_status(status, text));
        }

        let generated: GeneratedStrategy =
            serde_json::from_str(&text).map_err(|e| GenerationError::InvalidResponse {
                reason: e.to_string(),
            })?;
        if generated.code.trim().is_empty() {
            return Err(GenerationError::InvalidResponse {
                reason: "empty code".to_string(),
            });
        }
        debug!("Code generator returned {} bytes of code", generated.code.len());
        Ok(generated)
    }
}

/// Offline, deterministic generator. Ignores the description, starts from
/// the previous config (or its base), applies suggested adjustments to
/// unprotected parameters and renders the source from the result.
pub struct TemplateGenerator {
    base: StrategyConfig,
}

impl TemplateGenerator {
    pub fn new(base: StrategyConfig) -> Self {
        Self { base }
    }
}

#[async_trait]
impl CodeGenerator for TemplateGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedStrategy, GenerationError> {
        let mut config = request
            .previous_config
            .clone()
            .unwrap_or_else(|| self.base.clone());

        for (name, value) in &request.protected_parameters {
            if let Some(p) = config.parameters.get_mut(name) {
                p.value = *value;
                p.protected = true;
            }
        }

        let suggestions = request.feedback.iter().flat_map(|f| f.suggestions.iter());
        for suggestion in suggestions {
            if let Suggestion::AdjustParameter { name, to, .. } = suggestion {
                match config.parameters.get_mut(name) {
                    Some(p) if !p.protected && !request.protected_parameters.contains_key(name) => {
                        debug!("Template: {} {} -> {}", name, p.value, to);
                        p.value = *to;
                    }
                    _ => {}
                }
            }
        }

        let code = template::render(&config);
        Ok(GeneratedStrategy { code, config })
    }
}

/// Longest single wait between attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Retries transient failures with exponential backoff. Anything else, and
/// the last transient failure once attempts run out, goes to the caller.
pub struct RetryingGenerator<G> {
    inner: G,
    max_attempts: u32,
    base_delay: Duration,
}

impl<G: CodeGenerator> RetryingGenerator<G> {
    pub fn new(inner: G, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .map_or(MAX_RETRY_DELAY, |d| d.min(MAX_RETRY_DELAY))
    }
}

#[async_trait]
impl<G: CodeGenerator> CodeGenerator for RetryingGenerator<G> {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedStrategy, GenerationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.generate(request).await {
                Ok(generated) => {
                    if attempt > 1 {
                        info!("Code generation succeeded on attempt {}", attempt);
                    }
                    return Ok(generated);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let wait = self.delay(attempt);
                    warn!(
                        "Code generation attempt {}/{} failed: {} (retrying in {:?})",
                        attempt, self.max_attempts, e, wait
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(GenerationError::Exhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::rsi_config;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Flaky {
        failures: u32,
        error: GenerationError,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CodeGenerator for Flaky {
        async fn generate(&self, _: &GenerationRequest) -> Result<GeneratedStrategy, GenerationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(GeneratedStrategy {
                    code: template::render(&rsi_config()),
                    config: rsi_config(),
                })
            }
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            description: "buy oversold AAPL".into(),
            feedback: None,
            protected_parameters: rsi_config().protected_parameters(),
            previous_config: None,
        }
    }

    fn flaky(failures: u32, error: GenerationError) -> (Flaky, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Flaky {
                failures,
                error,
                calls: calls.clone(),
            },
            calls,
        )
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (inner, calls) = flaky(2, GenerationError::Transient { reason: "503".into() });
        let gen = RetryingGenerator::new(inner, 3, Duration::from_millis(1));
        assert!(gen.generate(&request()).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_transient_failure_is_exhausted() {
        let (inner, calls) = flaky(10, GenerationError::Transient { reason: "timeout".into() });
        let gen = RetryingGenerator::new(inner, 3, Duration::from_millis(1));
        let err = gen.generate(&request()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let (inner, calls) = flaky(10, GenerationError::Rejected { reason: "400".into() });
        let gen = RetryingGenerator::new(inner, 5, Duration::from_millis(1));
        assert!(matches!(
            gen.generate(&request()).await,
            Err(GenerationError::Rejected { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_up_to_a_ceiling() {
        let (inner, _) = flaky(0, GenerationError::Rejected { reason: String::new() });
        let gen = RetryingGenerator::new(inner, 100, Duration::from_millis(100));
        assert_eq!(gen.delay(1), Duration::from_millis(100));
        assert_eq!(gen.delay(3), Duration::from_millis(400));
        assert_eq!(gen.delay(11), MAX_RETRY_DELAY);
        assert_eq!(gen.delay(90), MAX_RETRY_DELAY);

        let (inner, _) = flaky(0, GenerationError::Rejected { reason: String::new() });
        let huge = RetryingGenerator::new(inner, 100, Duration::MAX);
        assert_eq!(huge.delay(40), MAX_RETRY_DELAY);
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, String::new()).is_transient());
    }

    #[tokio::test]
    async fn template_applies_unprotected_adjustments_only() {
        let gen = TemplateGenerator::new(rsi_config());
        let mut req = request();
        req.feedback = Some(Feedback {
            iteration: 1,
            suggestions: vec![
                Suggestion::AdjustParameter {
                    name: "rsi_threshold".into(),
                    from: 30.0,
                    to: 33.0,
                    reason: "too few trades".into(),
                },
                Suggestion::AdjustParameter {
                    name: "rsi_exit".into(),
                    from: 70.0,
                    to: 63.0,
                    reason: "low win rate".into(),
                },
            ],
            ..Default::default()
        });
        let out = gen.generate(&req).await.unwrap();
        assert_eq!(out.config.param("rsi_threshold"), Some(30.0));
        assert_eq!(out.config.param("rsi_exit"), Some(63.0));
        assert_eq!(out.code, template::render(&out.config));
    }

    #[test]
    fn request_body_carries_schema() {
        let req = request();
        let body = HttpBody {
            description: &req.description,
            feedback: None,
            protected_parameters: &req.protected_parameters,
            previous_config: None,
            schema: config_schema(),
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["protected_parameters"]["rsi_threshold"], 30.0);
        assert!(v["schema"]["properties"]["exit_conditions"].is_object());
    }
}
