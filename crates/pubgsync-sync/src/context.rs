use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::error::SyncError;
use crate::store::SyncStore;

/// Per-run state shared by every stage: identity, start time, the watermark read at
/// start-up and the instant the run must finish by.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub watermark: DateTime<Utc>,
    pub first_run: bool,
    pub deadline: Instant,
}

impl RunContext {
    pub async fn begin(store: &dyn SyncStore, run_deadline: Duration) -> Result<Self, SyncError> {
        let started_at = Utc::now();
        let stored = store
            .load_watermark()
            .await
            .map_err(SyncError::persistence("watermark"))?;
        let ctx = Self {
            run_id: Uuid::new_v4(),
            started_at,
            watermark: stored.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            first_run: stored.is_none(),
            deadline: Instant::now() + run_deadline,
        };
        info!(
            run_id = %ctx.run_id,
            watermark = %ctx.watermark,
            first_run = ctx.first_run,
            "sync run starting"
        );
        Ok(ctx)
    }

    /// The earlier of the run deadline and `budget` from now.
    pub fn deadline_within(&self, budget: Duration) -> Instant {
        (Instant::now() + budget).min(self.deadline)
    }

    /// The watermark to persist once every stage has been attempted.
    pub fn next_watermark(&self) -> DateTime<Utc> {
        self.started_at.max(self.watermark)
    }
}
