//! Provider pool — multiplex LLM calls across named providers with lazy
//! instantiation, ordered failover, and quota-aware skipping.
//!
//! Quota tracking is three-layered; a provider is available only when every
//! layer agrees:
//!
//! | layer   | signal                                   | effect                      |
//! |---------|------------------------------------------|-----------------------------|
//! | config  | declared rpm/tpm limits                  | sliding 60 s windows        |
//! | headers | `x-ratelimit-remaining-*` and friends    | 0 blocks; stale after 60 s  |
//! | 429     | rate-limit-classified errors             | exhausted for retry-after   |

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, error, warn};

use nibot_core::config::{ProvidersConfig, QuotaConfig};
use nibot_core::event_log::EventLog;
use nibot_core::types::{ChatMessage, LlmResponse, ToolDefinition};

use crate::http_provider::HttpProvider;
use crate::traits::{ChatOptions, LlmProvider};

const WINDOW: Duration = Duration::from_secs(60);
const HEADER_TTL: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_AFTER: f64 = 60.0;

// ─────────────────────────────────────────────
// ProviderQuota
// ─────────────────────────────────────────────

/// Per-provider quota state. Methods take an explicit `now` so tests can
/// advance time; the `*_now` wrappers are the production surface.
pub struct ProviderQuota {
    pub name: String,
    pub rpm_limit: u32,
    pub tpm_limit: u32,
    minute_requests: VecDeque<Instant>,
    minute_tokens: VecDeque<(Instant, u32)>,
    exhausted_until: Option<Instant>,
    header_remaining_requests: Option<i64>,
    header_remaining_tokens: Option<i64>,
    header_updated_at: Option<Instant>,
}

impl ProviderQuota {
    pub fn new(name: impl Into<String>, rpm_limit: u32, tpm_limit: u32) -> Self {
        ProviderQuota {
            name: name.into(),
            rpm_limit,
            tpm_limit,
            minute_requests: VecDeque::new(),
            minute_tokens: VecDeque::new(),
            exhausted_until: None,
            header_remaining_requests: None,
            header_remaining_tokens: None,
            header_updated_at: None,
        }
    }

    /// Record one request's usage (self-counting layer).
    pub fn record_usage_at(&mut self, now: Instant, tokens: u32) {
        self.minute_requests.push_back(now);
        if tokens > 0 {
            self.minute_tokens.push_back((now, tokens));
        }
    }

    /// Calibrate remaining quota from response headers (header layer).
    pub fn update_from_headers_at(
        &mut self,
        now: Instant,
        remaining_requests: Option<i64>,
        remaining_tokens: Option<i64>,
    ) {
        if remaining_requests.is_some() {
            self.header_remaining_requests = remaining_requests;
            self.header_updated_at = Some(now);
        }
        if remaining_tokens.is_some() {
            self.header_remaining_tokens = remaining_tokens;
            self.header_updated_at = Some(now);
        }
    }

    /// Mark the provider temporarily exhausted (429 layer).
    pub fn record_rate_limit_at(&mut self, now: Instant, retry_after_secs: f64) {
        self.exhausted_until = Some(now + Duration::from_secs_f64(retry_after_secs.max(0.0)));
        warn!(provider = %self.name, retry_after_secs, "provider marked exhausted");
    }

    /// Availability is the AND of all three layers.
    pub fn is_available_at(&mut self, now: Instant) -> bool {
        if self.exhausted_until.is_some_and(|until| now < until) {
            return false;
        }

        match self.header_updated_at {
            Some(at) if now.duration_since(at) < HEADER_TTL => {
                if self.header_remaining_requests.is_some_and(|r| r <= 0) {
                    return false;
                }
                if self.header_remaining_tokens.is_some_and(|t| t <= 0) {
                    return false;
                }
            }
            Some(_) => {
                // Stale calibration: reset so the provider gets a fresh chance.
                self.header_remaining_requests = None;
                self.header_remaining_tokens = None;
                self.header_updated_at = None;
            }
            None => {}
        }

        self.prune(now);
        if self.rpm_limit > 0 && self.minute_requests.len() >= self.rpm_limit as usize {
            return false;
        }
        if self.tpm_limit > 0 {
            let total: u64 = self.minute_tokens.iter().map(|(_, t)| u64::from(*t)).sum();
            if total >= u64::from(self.tpm_limit) {
                return false;
            }
        }
        true
    }

    pub fn record_usage(&mut self, tokens: u32) {
        self.record_usage_at(Instant::now(), tokens);
    }

    pub fn record_rate_limit(&mut self, retry_after_secs: f64) {
        self.record_rate_limit_at(Instant::now(), retry_after_secs);
    }

    pub fn is_available(&mut self) -> bool {
        self.is_available_at(Instant::now())
    }

    fn prune(&mut self, now: Instant) {
        while self
            .minute_requests
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            self.minute_requests.pop_front();
        }
        while self
            .minute_tokens
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) >= WINDOW)
        {
            self.minute_tokens.pop_front();
        }
    }
}

// ─────────────────────────────────────────────
// Rate-limit classification
// ─────────────────────────────────────────────

/// Conservative rate-limit detection. True on:
/// - a `RateLimit` error class name,
/// - an explicit `status_code=429` / `status: 429`,
/// - an `HTTP 429` status phrase,
/// - the vendor phrase "too many requests".
///
/// A bare `429` substring is NOT sufficient (`"42900"` in a SQL error is
/// not a rate limit), and neither are non-HTTP uses of "rate"/"quota".
pub fn is_rate_limit_error(message: &str) -> bool {
    static STATUS_RE: OnceLock<Regex> = OnceLock::new();
    static HTTP_RE: OnceLock<Regex> = OnceLock::new();
    let status_re =
        STATUS_RE.get_or_init(|| Regex::new(r"(?i)status[_ ]?(?:code)?\s*[=:]\s*429\b").unwrap());
    let http_re = HTTP_RE.get_or_init(|| Regex::new(r"(?i)\bhttp\s+429\b").unwrap());

    let normalized = message.to_lowercase().replace(['_', '-'], "");
    if normalized.contains("ratelimiterror") || normalized.contains("ratelimitexceeded") {
        return true;
    }
    if status_re.is_match(message) || http_re.is_match(message) {
        return true;
    }
    message.to_lowercase().contains("too many requests")
}

/// Extract `retry-after N` seconds from an error message, default 60.
pub fn parse_retry_after(message: &str) -> f64 {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)retry.?after.?(\d+)").unwrap());
    re.captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

// ─────────────────────────────────────────────
// ProviderPool
// ─────────────────────────────────────────────

const DEFAULT_API_BASES: &[(&str, &str)] = &[
    ("openai", "https://api.openai.com/v1"),
    ("anthropic", "https://api.anthropic.com/v1"),
    ("openrouter", "https://openrouter.ai/api/v1"),
    ("deepseek", "https://api.deepseek.com/v1"),
];

/// The well-known API base for a built-in provider name; unknown names get
/// the OpenAI-compatible default.
pub fn default_api_base(name: &str) -> &'static str {
    DEFAULT_API_BASES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, base)| *base)
        .unwrap_or("https://api.openai.com/v1")
}

/// Lazily instantiates named providers and routes calls through an ordered
/// fallback chain, skipping quota-exhausted names.
pub struct ProviderPool {
    config: ProvidersConfig,
    default: Arc<dyn LlmProvider>,
    cache: StdMutex<HashMap<String, Arc<dyn LlmProvider>>>,
    quotas: StdMutex<HashMap<String, Arc<StdMutex<ProviderQuota>>>>,
    event_log: Arc<EventLog>,
}

impl ProviderPool {
    pub fn new(config: ProvidersConfig, default: Arc<dyn LlmProvider>, event_log: Arc<EventLog>) -> Self {
        ProviderPool {
            config,
            default,
            cache: StdMutex::new(HashMap::new()),
            quotas: StdMutex::new(HashMap::new()),
            event_log,
        }
    }

    /// Get a provider by name. Empty or unconfigured names resolve to the
    /// default provider; everything else is constructed on first use and
    /// cached.
    pub fn get(&self, name: &str) -> Arc<dyn LlmProvider> {
        if name.is_empty() {
            return self.default.clone();
        }
        if let Some(cached) = self.cache.lock().unwrap().get(name).cloned() {
            return cached;
        }
        let Some(pc) = self.config.get(name).filter(|pc| pc.is_configured()) else {
            return self.default.clone();
        };

        let api_base = if pc.api_base.is_empty() {
            default_api_base(name).to_string()
        } else {
            pc.api_base.clone()
        };
        let model = if pc.model.is_empty() {
            self.default.default_model().to_string()
        } else {
            pc.model.clone()
        };
        let provider: Arc<dyn LlmProvider> =
            Arc::new(HttpProvider::new(name, api_base, pc.api_key.clone(), model));
        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), provider.clone());
        provider
    }

    /// Whether a named provider can be resolved to a non-default instance.
    pub fn has(&self, name: &str) -> bool {
        if self.cache.lock().unwrap().contains_key(name) {
            return true;
        }
        self.config.get(name).is_some_and(|pc| pc.is_configured())
    }

    /// Install a pre-built provider under a name (composition root, tests).
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.cache.lock().unwrap().insert(name.into(), provider);
    }

    /// The quota tracker for a name, created on first touch with the
    /// configured limits (0/0 when the config declares none).
    pub fn quota(&self, name: &str) -> Arc<StdMutex<ProviderQuota>> {
        let mut quotas = self.quotas.lock().unwrap();
        quotas
            .entry(name.to_string())
            .or_insert_with(|| {
                let qc: QuotaConfig = self
                    .config
                    .get(name)
                    .map(|pc| pc.quota)
                    .unwrap_or_default();
                Arc::new(StdMutex::new(ProviderQuota::new(name, qc.rpm, qc.tpm)))
            })
            .clone()
    }

    /// Per-provider availability snapshot (health reporting).
    pub fn availability(&self) -> Vec<(String, bool, u32)> {
        let names: Vec<String> = self.quotas.lock().unwrap().keys().cloned().collect();
        names
            .into_iter()
            .map(|name| {
                let quota = self.quota(&name);
                let mut q = quota.lock().unwrap();
                let rpm = q.rpm_limit;
                (name, q.is_available(), rpm)
            })
            .collect()
    }

    /// Try providers in chain order, skipping quota-exhausted ones.
    /// Returns the first non-error response, or a synthetic error response
    /// aggregating every failure.
    pub async fn chat_with_fallback(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        chain: &[String],
        opts: &ChatOptions,
    ) -> LlmResponse {
        let mut candidates: Vec<(String, Arc<dyn LlmProvider>)> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        for name in chain {
            if !self.quota(name).lock().unwrap().is_available() {
                skipped.push(name.clone());
                continue;
            }
            if self.has(name) {
                candidates.push((name.clone(), self.get(name)));
            }
        }
        if !skipped.is_empty() {
            debug!(?skipped, "quota-exhausted providers skipped");
        }
        if candidates.is_empty() {
            candidates.push(("default".into(), self.default.clone()));
        }

        let mut errors: Vec<String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        for (name, provider) in candidates {
            let model = opts
                .model
                .clone()
                .unwrap_or_else(|| provider.default_model().to_string());
            let t0 = Instant::now();
            let result = provider.chat(messages, tools, opts).await;
            let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;

            if !result.is_error() {
                self.event_log.log_llm_call(
                    &name,
                    &model,
                    result.usage.prompt_tokens,
                    result.usage.completion_tokens,
                    latency_ms,
                    true,
                    "",
                );
                self.record_success(&name, &result);

                // Failed-over and quota-skipped names both count as skipped
                // in the decision trail.
                let mut all_skipped = skipped.clone();
                all_skipped.extend(failed.iter().cloned());
                let reason = if all_skipped.is_empty() {
                    "first candidate available".to_string()
                } else {
                    errors
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "earlier providers quota-exhausted".into())
                };
                self.event_log
                    .log_provider_switch(chain, &name, &all_skipped, &reason);
                return result;
            }

            let message = result.content.clone().unwrap_or_default();
            self.event_log
                .log_llm_call(&name, &model, 0, 0, latency_ms, false, &message);
            self.record_error(&name, &message);
            warn!(provider = %name, error = %message, "provider failed, trying next");
            errors.push(format!("{name}: {message}"));
            failed.push(name);
        }

        let detail = errors.join("; ");
        error!(chain = ?chain, detail = %detail, "all providers in chain failed");
        LlmResponse::error(format!("All providers failed: {detail}"))
    }

    /// Record usage and calibrate quota from a successful response.
    fn record_success(&self, name: &str, result: &LlmResponse) {
        let quota = self.quota(name);
        let mut q = quota.lock().unwrap();
        q.record_usage(result.usage.total_tokens);

        let rl = &result.ratelimit_info;
        let remaining_req = rl
            .get("x-ratelimit-remaining-requests")
            .or_else(|| rl.get("anthropic-ratelimit-requests-remaining"))
            .copied();
        let remaining_tok = rl
            .get("x-ratelimit-remaining-tokens")
            .or_else(|| rl.get("anthropic-ratelimit-tokens-remaining"))
            .copied();
        if remaining_req.is_some() || remaining_tok.is_some() {
            q.update_from_headers_at(Instant::now(), remaining_req, remaining_tok);
        }
    }

    /// Error hook: rate-limit-classified failures exhaust the provider for
    /// the parsed retry-after window.
    fn record_error(&self, name: &str, message: &str) {
        if is_rate_limit_error(message) {
            let retry_after = parse_retry_after(message);
            self.quota(name).lock().unwrap().record_rate_limit(retry_after);
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
