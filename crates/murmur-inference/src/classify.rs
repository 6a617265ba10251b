//! HTTP failure classification for adapter calls.

use reqwest::StatusCode;

use murmur_core::{Error, FailureCode};

/// Classify a non-success HTTP response into the adapter error taxonomy.
///
/// Rate limits, timeouts, and server errors are transient and eligible for
/// retry; everything else is a permanent rejection carrying
/// `permanent_code`.
pub fn classify_http_failure(
    status: StatusCode,
    body: &str,
    permanent_code: FailureCode,
) -> Error {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Error::TransientAdapter(format!("upstream returned {status}: {body}"))
    } else {
        Error::PermanentAdapter {
            code: permanent_code,
            message: format!("upstream returned {status}: {body}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_is_transient() {
        let err = classify_http_failure(
            StatusCode::TOO_MANY_REQUESTS,
            "slow down",
            FailureCode::UnsupportedMedia,
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_server_errors_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            let err = classify_http_failure(status, "", FailureCode::AdapterError);
            assert!(err.is_transient(), "{status} should be transient");
        }
    }

    #[test]
    fn test_client_errors_are_permanent() {
        let err = classify_http_failure(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "bad codec",
            FailureCode::UnsupportedMedia,
        );
        assert!(!err.is_transient());
        match err {
            Error::PermanentAdapter { code, .. } => {
                assert_eq!(code, FailureCode::UnsupportedMedia);
            }
            other => panic!("expected PermanentAdapter, got {other}"),
        }
    }
}
