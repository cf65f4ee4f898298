use std::future::Future;
use std::time::Duration;

use conductor_error::{ProviderError, ProviderErrorKind};
use tokio::time::{sleep, timeout};

use super::{CompletionRequest, CostBreakdown, ModelPricing, TokenUsage};

/// Cross-cutting behavior every vendor adapter shares.
#[derive(Debug, Clone)]
pub struct ProviderPolicy {
    /// Deadline each operation races against.
    pub timeout: Duration,
    pub max_retries: u32,
    /// Base for the exponential backoff when the vendor gave no
    /// `retry-after` hint.
    pub retry_delay: Duration,
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_retries: 3,
            retry_delay: Duration::from_millis(1_000),
        }
    }
}

pub fn validate_request(
    provider: &'static str,
    request: &CompletionRequest,
) -> Result<(), ProviderError> {
    if request.messages.is_empty() {
        return Err(ProviderError::invalid_request(
            provider,
            "messages must not be empty",
        ));
    }
    if request.model.trim().is_empty() {
        return Err(ProviderError::invalid_request(
            provider,
            "model must not be empty",
        ));
    }
    if request.max_tokens == 0 {
        return Err(ProviderError::invalid_request(
            provider,
            "maxTokens must be positive",
        ));
    }
    Ok(())
}

/// Races an operation against the policy deadline. Timeouts come back as a
/// retryable error.
pub async fn with_timeout<T, F>(
    provider: &'static str,
    deadline: Duration,
    operation: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::timeout(provider, deadline)),
    }
}

/// Retry loop for non-streaming operations. The delay honors the error's
/// `retry_after` hint when present, falling back to exponential backoff.
/// Non-retryable errors and exhausted attempts propagate immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &ProviderPolicy,
    provider: &'static str,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match with_timeout(provider, policy.timeout, operation()).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let exhausted = attempt + 1 >= policy.max_retries.max(1);
                if !err.is_retryable() || exhausted {
                    return Err(err);
                }
                let delay = err
                    .retry_after
                    .unwrap_or_else(|| policy.retry_delay * 2u32.pow(attempt));
                tracing::debug!(
                    provider,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    kind = err.kind.as_str(),
                    "retrying after retryable provider error"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// USD cost for one completion. Cached input is billed separately and only
/// when both the count and the cached price are known.
pub fn cost_breakdown(pricing: &ModelPricing, usage: &TokenUsage) -> CostBreakdown {
    let input_cost = usage.input_tokens as f64 * pricing.input_per_1m / 1e6;
    let output_cost = usage.output_tokens as f64 * pricing.output_per_1m / 1e6;
    let cached_cost = match (usage.cached_input_tokens, pricing.cached_input_per_1m) {
        (Some(tokens), Some(price)) => tokens as f64 * price / 1e6,
        _ => 0.0,
    };
    CostBreakdown {
        input_cost,
        output_cost,
        cached_cost,
        total_cost: input_cost + output_cost + cached_cost,
        currency: "USD".to_string(),
    }
}

/// Shared status-code translation; adapters layer vendor specifics on top.
pub fn classify_status(provider: &'static str, status: u16, message: String) -> ProviderError {
    let kind = match status {
        401 | 403 => ProviderErrorKind::Authentication,
        404 => ProviderErrorKind::ModelNotFound,
        429 => ProviderErrorKind::RateLimit,
        400 | 422 => ProviderErrorKind::InvalidRequest,
        500..=599 => ProviderErrorKind::Server,
        _ => ProviderErrorKind::Unknown,
    };
    ProviderError::new(kind, provider, message).with_status(status)
}

pub fn retry_after_from_headers(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
