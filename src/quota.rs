use crate::db::{self, Pool};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitStatus {
    pub reached: bool,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LimitState {
    reset_at: Option<DateTime<Utc>>,
    cleared: bool,
}

/// Tracks the YouTube upload limit window. The window persists across restarts.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    pool: Pool,
    state: Arc<Mutex<LimitState>>,
}

impl QuotaTracker {
    /// Restore the persisted window, if any.
    pub async fn restore(pool: Pool) -> Result<Self> {
        let reset_at = db::load_limit(&pool).await?;
        if let Some(at) = reset_at {
            info!(%at, "upload limit still active from previous run");
        }
        Ok(Self {
            pool,
            state: Arc::new(Mutex::new(LimitState {
                reset_at,
                cleared: false,
            })),
        })
    }

    /// Start a limit window lasting `hours`.
    pub async fn set_reached(&self, hours: u32) -> Result<DateTime<Utc>> {
        let reset_at = Utc::now() + Duration::hours(i64::from(hours));
        let mut state = self.state.lock().await;
        state.reset_at = Some(reset_at);
        state.cleared = false;
        db::save_limit(&self.pool, Some(reset_at)).await?;
        warn!(%reset_at, hours, "upload limit reached");
        Ok(reset_at)
    }

    /// Current status. An expired window is cleared here.
    pub async fn status(&self) -> LimitStatus {
        let mut state = self.state.lock().await;
        if let Some(at) = state.reset_at {
            if Utc::now() >= at {
                state.reset_at = None;
                state.cleared = true;
                if let Err(err) = db::save_limit(&self.pool, None).await {
                    warn!(?err, "failed to clear persisted upload limit");
                }
                info!("upload limit window ended");
            }
        }
        LimitStatus {
            reached: state.reset_at.is_some(),
            reset_at: state.reset_at,
        }
    }

    pub async fn is_reached(&self) -> bool {
        self.status().await.reached
    }

    /// True once after a window has ended.
    pub async fn take_cleared(&self) -> bool {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.cleared)
    }
}
