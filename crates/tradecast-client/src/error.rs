/// Errors raised while constructing a session. Runtime transport failures
/// never surface here; they are reported through session state.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid stream url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no tokio runtime available to drive the session")]
    NoRuntime,
}

impl ClientError {
    pub fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// Accept only absolute http(s) URLs.
pub fn validate_url(url: &str) -> Result<reqwest::Url, ClientError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| ClientError::invalid_url(url, e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ClientError::invalid_url(url, format!("unsupported scheme {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_urls() {
        assert!(validate_url("http://127.0.0.1:3000/api/sse").is_ok());
        assert!(validate_url("https://example.com/api/sse").is_ok());
    }

    #[test]
    fn rejects_relative_and_foreign_schemes() {
        assert!(matches!(validate_url("/api/sse"), Err(ClientError::InvalidUrl { .. })));
        let err = validate_url("ws://localhost/api/sse").unwrap_err();
        assert!(err.to_string().contains("unsupported scheme ws"));
    }
}
