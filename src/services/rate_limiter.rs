//! Per-user rate limiting for expensive refresh actions, e.g. the manual
//! `/api/portfolio/refresh` endpoint.
//!
//! Fails closed: any error while checking the limit is treated as "deny",
//! since silently allowing an unbounded refresh rate would defeat the
//! limiter's purpose.

use crate::core::{CoreError, CoreResult};
use crate::database::PostgresManager;
use chrono::Utc;
use std::sync::Arc;

pub struct RateLimiter {
    postgres: Arc<PostgresManager>,
    window_minutes: i64,
}

impl RateLimiter {
    pub fn new(postgres: Arc<PostgresManager>, window_minutes: i64) -> Self {
        Self { postgres, window_minutes }
    }

    /// Returns `Ok(())` if `action_type` is allowed for `user_id` right now,
    /// advancing the limiter's state as a side effect. Returns
    /// `CoreError::RateLimited` otherwise, and `CoreError::RateLimited` on
    /// any underlying failure as well (fail-closed).
    pub async fn check_and_record(&self, user_id: &str, action_type: &str) -> CoreResult<()> {
        let cutoff = Utc::now() - chrono::Duration::minutes(self.window_minutes);
        match self.postgres.try_rate_limited_action(user_id, action_type, cutoff).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(CoreError::RateLimited(format!(
                "{action_type} for {user_id} allowed at most once every {} minutes",
                self.window_minutes
            ))),
            Err(e) => Err(CoreError::RateLimited(format!("rate limit check failed, denying by default: {e}"))),
        }
    }
}
