//! HTTP failure classification shared by the model and embedding adapters.

use substrate_core::SubstrateError;

use crate::router::MAX_RETRY_AFTER;

/// Classify a reqwest error: timeouts and connection failures are transient.
pub(crate) fn classify_request_error(context: &str, err: reqwest::Error) -> SubstrateError {
    let message = format!("{context}: {err}");
    if err.is_timeout() || err.is_connect() || err.is_body() {
        SubstrateError::retryable(message)
    } else {
        SubstrateError::fatal(message)
    }
}

/// Turn a non-success HTTP response into a classified error, honouring `Retry-After` on 429.
pub(crate) async fn error_from_response(resp: reqwest::Response) -> SubstrateError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.min(MAX_RETRY_AFTER.as_secs()));
    let body = resp.text().await.unwrap_or_default();
    match (status, retry_after) {
        (429, Some(secs)) => SubstrateError::RateLimited {
            retry_after_secs: secs,
        },
        _ => SubstrateError::from_http_status(status, truncate_body(&body)),
    }
}

fn truncate_body(body: &str) -> &str {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = "é".repeat(400);
        let cut = truncate_body(&body);
        assert!(cut.len() <= 512);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
