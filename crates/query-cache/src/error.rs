//! Cache error types.

use std::any::Any;

use serde::Serialize;
use thiserror::Error;

use crate::key::CanonicalKey;

/// Errors signaled synchronously to callers of the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// `refetch` was requested for a key with no recorded query function.
    #[error("No query function registered for key: {0}")]
    NoQueryFn(CanonicalKey),

    /// A structured key could not be turned into a query key.
    #[error("Invalid query key: {0}")]
    InvalidKey(#[from] serde_json::Error),
}

/// A fetch failure, normalized for storage in query state.
///
/// Every failure of a query function is rendered to this uniform shape
/// before it is stored or signaled, so it can be cloned into snapshots.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct QueryError {
    message: String,
}

impl QueryError {
    /// Create an error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Get the rendered error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::new(format!("query function panicked: {}", detail))
    }
}

impl From<anyhow::Error> for QueryError {
    fn from(err: anyhow::Error) -> Self {
        // Alternate formatting keeps the whole context chain.
        Self::new(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_query_error_keeps_context_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("connection reset"));
        let err = err.context("loading products").unwrap_err();

        let normalized = QueryError::from(err);
        assert_eq!(normalized.message(), "loading products: connection reset");
        assert_eq!(normalized.to_string(), normalized.message());
    }

    #[test]
    fn test_query_error_from_panic_payload() {
        let err = QueryError::from_panic(Box::new("boom"));
        assert_eq!(err.message(), "query function panicked: boom");

        let err = QueryError::from_panic(Box::new(String::from("owned boom")));
        assert_eq!(err.message(), "query function panicked: owned boom");

        let err = QueryError::from_panic(Box::new(42u8));
        assert_eq!(err.message(), "query function panicked: unknown panic");
    }

    #[test]
    fn test_no_query_fn_display() {
        let key = crate::QueryKey::from("products").canonical();
        let err = CacheError::NoQueryFn(key);
        assert_eq!(
            err.to_string(),
            r#"No query function registered for key: "products""#
        );
    }
}
