//! Query status state machine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::QueryError;

/// Status a query can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryStatus {
    /// Known to the cache but nothing is loaded or loading.
    Idle,
    /// First fetch in progress, no data yet.
    Loading,
    /// Background refetch in progress, previous data still served.
    Fetching,
    /// Data from the first successful load (or initial data).
    FirstSuccess,
    /// Data from a later successful load or a direct write.
    Success,
    /// First fetch failed.
    Error,
}

impl QueryStatus {
    /// Get the status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Fetching => "fetching",
            Self::FirstSuccess => "first-success",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Check if this is one of the success states.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::FirstSuccess)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a query was last updated, for staleness computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatedAt {
    /// Sentinel that is always considered stale.
    ForceStale,
    /// Updated at the given instant.
    At(Instant),
}

impl UpdatedAt {
    /// The current instant.
    pub fn now() -> Self {
        Self::At(Instant::now())
    }

    /// Time since the update, `None` for the stale sentinel.
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            Self::ForceStale => None,
            Self::At(at) => Some(Instant::now().saturating_duration_since(*at)),
        }
    }
}

/// Snapshot of a single query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    /// Current status.
    pub status: QueryStatus,
    /// Last known successful value.
    pub data: Option<T>,
    /// Last fetch error, only set when `status` is [`QueryStatus::Error`].
    pub error: Option<QueryError>,
    /// Last transition relevant to staleness.
    pub last_updated_at: UpdatedAt,
}

impl<T> QueryState<T> {
    /// The state of a query nothing has happened to yet.
    pub fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            last_updated_at: UpdatedAt::now(),
        }
    }

    /// Check whether more than `stale_time` has passed since the last update.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        self.last_updated_at
            .elapsed()
            .map_or(true, |elapsed| elapsed > stale_time)
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

/// What a renderer shows for a query.
///
/// `first-success` is reported as `success`, and data is hidden while
/// loading or after a failed first load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult<T> {
    /// Status as rendered; a first success reads as `success`.
    pub status: QueryStatus,
    /// Cached value, hidden while loading or after a failed load.
    pub data: Option<T>,
    /// Failure of the last load, set only in the `error` status.
    pub error: Option<QueryError>,
    /// No data yet and a first load in progress.
    pub is_loading: bool,
    /// Previous data shown while a background refetch runs.
    pub is_fetching: bool,
    /// The last load failed.
    pub is_error: bool,
    /// Data from a completed load or a direct write is available.
    pub is_success: bool,
}

impl<T> From<QueryState<T>> for QueryResult<T> {
    fn from(state: QueryState<T>) -> Self {
        let mut result = Self {
            status: state.status,
            data: None,
            error: None,
            is_loading: false,
            is_fetching: false,
            is_error: false,
            is_success: false,
        };

        match state.status {
            QueryStatus::Idle => {}
            QueryStatus::Loading => result.is_loading = true,
            QueryStatus::Fetching => {
                result.data = state.data;
                result.is_fetching = true;
            }
            QueryStatus::Error => {
                result.error = state.error;
                result.is_error = true;
            }
            QueryStatus::Success | QueryStatus::FirstSuccess => {
                result.status = QueryStatus::Success;
                result.data = state.data;
                result.is_success = true;
            }
        }

        result
    }
}
