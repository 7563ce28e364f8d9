use thiserror::Error;

/// Crawl-wide error types for Marquee.
#[derive(Error, Debug)]
pub enum CrawlError {
    /// A page fetch failed. `transient` marks failures worth retrying.
    #[error("fetch error: {message}")]
    Fetch { message: String, transient: bool },

    /// A fetch or wait exceeded its deadline.
    #[error("timed out after {0} seconds")]
    Timeout(u64),

    /// The headless browser failed (navigation, CDP, interaction).
    #[error("browser error: {0}")]
    Browser(String),

    /// A detail document yielded no resolvable identity.
    #[error("no resolvable identity for {url}")]
    MissingIdentity { url: String },

    /// A rendered fetch was requested but no browser is available.
    #[error("rendered fetch requested but no browser is configured")]
    RenderedUnavailable,

    /// A site profile is malformed or inconsistent.
    #[error("profile error: {0}")]
    Profile(String),

    /// A CSS selector in a profile failed to parse.
    #[error("invalid selector `{0}`")]
    Selector(String),

    /// Writing to the record sink failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CrawlError {
    /// Shorthand for a retryable fetch failure.
    pub fn transient(message: impl Into<String>) -> Self {
        CrawlError::Fetch {
            message: message.into(),
            transient: true,
        }
    }

    /// Shorthand for a fetch failure that should not be retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        CrawlError::Fetch {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if the task that hit this error is worth re-queueing.
    pub fn is_transient(&self) -> bool {
        match self {
            CrawlError::Fetch { transient, .. } => *transient,
            CrawlError::Timeout(_) | CrawlError::Browser(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(CrawlError::transient("connection reset").is_transient());
        assert!(CrawlError::Timeout(15).is_transient());
        assert!(CrawlError::Browser("navigation failed".into()).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(!CrawlError::permanent("HTTP 404").is_transient());
        assert!(
            !CrawlError::MissingIdentity {
                url: "https://example.com/movie/".into()
            }
            .is_transient()
        );
        assert!(!CrawlError::RenderedUnavailable.is_transient());
        assert!(!CrawlError::Selector("a[".into()).is_transient());
    }
}
