use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::db::models::{AccessGrant, User};

/// Find user by hypervisor username
pub async fn find_by_username(pool: &PgPool, username: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT user_id, name, username, is_admin, created_at, updated_at
        FROM users
        WHERE username = $1
        "#,
    )
    .bind(username)
    .fetch_optional(pool)
    .await
    .context("Failed to find user by username")?;

    Ok(user)
}

/// Ranges of every source user granted access into `target_user_id`'s range.
///
/// Source users without a range are skipped.
pub async fn access_grants_for(pool: &PgPool, target_user_id: &str) -> Result<Vec<AccessGrant>> {
    let grants = sqlx::query_as::<_, AccessGrant>(
        r#"
        SELECT r.range_number AS second_octet, u.username
        FROM range_access ra
        CROSS JOIN LATERAL unnest(ra.source_user_ids) AS src(user_id)
        JOIN users u ON u.user_id = src.user_id
        JOIN ranges r ON r.user_id = src.user_id
        WHERE ra.target_user_id = $1
        ORDER BY r.range_number
        "#,
    )
    .bind(target_user_id)
    .fetch_all(pool)
    .await
    .context("Failed to list access grants")?;

    Ok(grants)
}
