use std::time::Duration;

use pubgsync_adapters::UpstreamError;
use thiserror::Error;

use crate::planner::PlanningError;
use crate::store::StoreError;

/// Failure taxonomy of a sync run.
///
/// Only `PlanningInvariantViolation`, `DeadlineExceeded`, store failures on run-level
/// bookkeeping and a season list that could not be fetched at all abort a run. The last
/// surfaces as the fetch error itself. Everything else is recorded against a single key and the
/// run carries on.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient upstream failure for {key}: {message}")]
    TransientUpstream { key: String, message: String },

    #[error("upstream request for {key} failed: {source}")]
    UpstreamRequest {
        key: String,
        #[source]
        source: UpstreamError,
    },

    #[error("malformed upstream document for {key}: {source}")]
    MalformedResponse {
        key: String,
        #[source]
        source: UpstreamError,
    },

    #[error("persistence failed for {key}: {source}")]
    Persistence {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("planning invariant violated: {0}")]
    PlanningInvariantViolation(#[from] PlanningError),

    #[error("sync run exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl SyncError {
    pub fn from_upstream(key: impl Into<String>, err: UpstreamError) -> Self {
        let key = key.into();
        match err {
            UpstreamError::QuotaExceeded { .. } => Self::TransientUpstream {
                key,
                message: err.to_string(),
            },
            UpstreamError::Malformed { .. } => Self::MalformedResponse { key, source: err },
            UpstreamError::Request { .. } | UpstreamError::Status { .. } => {
                Self::UpstreamRequest { key, source: err }
            }
        }
    }

    pub fn persistence(key: impl Into<String>) -> impl FnOnce(StoreError) -> Self {
        let key = key.into();
        move |source| Self::Persistence { key, source }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PlanningInvariantViolation(_) | Self::DeadlineExceeded(_)
        )
    }
}
