use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::models::{Range, RangeState};

const RANGE_COLUMNS: &str = "range_number, user_id, name, testing_enabled, allowed_domains, \
     allowed_ips, range_state, last_deployment, created_at, updated_at";

/// Find the range owned by a user
pub async fn find_by_user(pool: &PgPool, user_id: &str) -> Result<Option<Range>> {
    let range = sqlx::query_as::<_, Range>(&format!(
        "SELECT {} FROM ranges WHERE user_id = $1",
        RANGE_COLUMNS
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("Failed to find range by user")?;

    Ok(range)
}

/// Update range state
pub async fn update_state(pool: &PgPool, range_number: i32, state: RangeState) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ranges
        SET range_state = $2, updated_at = NOW()
        WHERE range_number = $1
        "#,
    )
    .bind(range_number)
    .bind(state)
    .execute(pool)
    .await
    .context("Failed to update range state")?;

    Ok(())
}

/// Mark a range as deploying and record the deployment start time
pub async fn mark_deploying(pool: &PgPool, range_number: i32, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ranges
        SET range_state = $2, last_deployment = $3, updated_at = NOW()
        WHERE range_number = $1
        "#,
    )
    .bind(range_number)
    .bind(RangeState::Deploying)
    .bind(at)
    .execute(pool)
    .await
    .context("Failed to mark range as deploying")?;

    Ok(())
}

/// Turn off testing mode and forget its allow-lists
pub async fn reset_testing(pool: &PgPool, range_number: i32) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ranges
        SET testing_enabled = FALSE, allowed_domains = '{}', allowed_ips = '{}', updated_at = NOW()
        WHERE range_number = $1
        "#,
    )
    .bind(range_number)
    .execute(pool)
    .await
    .context("Failed to reset range testing state")?;

    Ok(())
}
