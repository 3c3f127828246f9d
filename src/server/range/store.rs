use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::models::{AccessGrant, Range, RangeState};
use crate::db::{ranges, users};

/// Range persistence as seen by the lifecycle controller
#[async_trait]
pub trait RangeStore: Send + Sync {
    /// The range owned by `user_id`, if any
    async fn find_owner_range(&self, user_id: &str) -> Result<Option<Range>>;

    /// Record `DEPLOYING` together with the deployment start time
    async fn mark_deploying(&self, range_number: i32, at: DateTime<Utc>) -> Result<()>;

    async fn set_state(&self, range_number: i32, state: RangeState) -> Result<()>;

    /// Leave testing mode and clear its allow-lists
    async fn reset_testing(&self, range_number: i32) -> Result<()>;

    /// Ranges of other tenants that `user_id`'s range must be able to reach
    async fn access_grants(&self, user_id: &str) -> Result<Vec<AccessGrant>>;
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgRangeStore {
    pool: PgPool,
}

impl PgRangeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RangeStore for PgRangeStore {
    async fn find_owner_range(&self, user_id: &str) -> Result<Option<Range>> {
        ranges::find_by_user(&self.pool, user_id).await
    }

    async fn mark_deploying(&self, range_number: i32, at: DateTime<Utc>) -> Result<()> {
        ranges::mark_deploying(&self.pool, range_number, at).await
    }

    async fn set_state(&self, range_number: i32, state: RangeState) -> Result<()> {
        ranges::update_state(&self.pool, range_number, state).await
    }

    async fn reset_testing(&self, range_number: i32) -> Result<()> {
        ranges::reset_testing(&self.pool, range_number).await
    }

    async fn access_grants(&self, user_id: &str) -> Result<Vec<AccessGrant>> {
        users::access_grants_for(&self.pool, user_id).await
    }
}
