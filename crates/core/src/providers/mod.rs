pub mod gemini;
pub mod groq;

pub use gemini::GeminiEmbeddingService;
pub use groq::GroqChatService;

use crate::error::ProviderError;
use reqwest::StatusCode;

/// Maps a non-success response to a typed error; 429 and quota/rate wording
/// become [`ProviderError::RateLimited`] so callers can back off.
pub(crate) fn classify_failure(provider: &str, status: StatusCode, body: String) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS || mentions_rate_limit(&body) {
        return ProviderError::RateLimited {
            provider: provider.to_string(),
            details: body,
        };
    }

    ProviderError::Api {
        provider: provider.to_string(),
        status: status.as_u16(),
        details: body,
    }
}

pub(crate) fn mentions_rate_limit(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("quota")
        || lowered.contains("rate limit")
        || lowered.contains("rate_limit")
        || lowered.contains("resource_exhausted")
        || lowered.contains("429")
}

pub(crate) fn transport_error(provider: &str, error: reqwest::Error, after: std::time::Duration) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout {
            provider: provider.to_string(),
            after,
        }
    } else {
        ProviderError::Http(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_rate_limited() {
        let error = classify_failure("gemini", StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(error.is_rate_limited());
    }

    #[test]
    fn quota_wording_is_rate_limited() {
        let error = classify_failure(
            "gemini",
            StatusCode::FORBIDDEN,
            "Quota exceeded for metric".to_string(),
        );
        assert!(error.is_rate_limited());
    }

    #[test]
    fn other_client_errors_pass_through() {
        let error = classify_failure("groq", StatusCode::BAD_REQUEST, "invalid model".to_string());
        assert!(matches!(error, ProviderError::Api { status: 400, .. }));
    }
}
