//! Settings table access
//!
//! Generic string-keyed storage with typed parsing. `get_or_init` is the
//! runtime-settings workhorse: it persists the default on first access so
//! the settings table always shows the effective configuration.

use std::fmt::Display;
use std::str::FromStr;

use selah_common::Result;
use sqlx::SqlitePool;
use tracing::warn;

pub async fn get_setting<T: FromStr>(pool: &SqlitePool, key: &str) -> Result<Option<T>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    match row {
        Some((value,)) => match value.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => {
                warn!(key, value, "setting value failed to parse, treating as unset");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

pub async fn set_setting<T: Display>(pool: &SqlitePool, key: &str, value: T) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at)
        VALUES (?, ?, datetime('now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Reads a setting, persisting and returning `default` when the key is
/// missing or unparseable.
pub async fn get_or_init<T>(pool: &SqlitePool, key: &str, default: T) -> Result<T>
where
    T: FromStr + Display,
{
    match get_setting::<T>(pool, key).await? {
        Some(value) => Ok(value),
        None => {
            set_setting(pool, key, &default).await?;
            Ok(default)
        }
    }
}

pub async fn delete_setting(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = selah_common::db::init_database(&dir.path().join("test.db"))
            .await
            .unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn set_then_get_parses_typed_values() {
        let (_dir, pool) = test_pool().await;
        set_setting(&pool, "test_number", 42u32).await.unwrap();

        let value: Option<u32> = get_setting(&pool, "test_number").await.unwrap();
        assert_eq!(value, Some(42));

        let missing: Option<u32> = get_setting(&pool, "not_there").await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn unparseable_value_reads_as_unset() {
        let (_dir, pool) = test_pool().await;
        set_setting(&pool, "test_number", "not a number").await.unwrap();

        let value: Option<u32> = get_setting(&pool, "test_number").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn get_or_init_persists_the_default() {
        let (_dir, pool) = test_pool().await;

        let value: u64 = get_or_init(&pool, "test_window", 3600u64).await.unwrap();
        assert_eq!(value, 3600);

        // now stored, a direct read sees it
        let stored: Option<u64> = get_setting(&pool, "test_window").await.unwrap();
        assert_eq!(stored, Some(3600));

        // an existing value is not overwritten
        set_setting(&pool, "test_window", 60u64).await.unwrap();
        let value: u64 = get_or_init(&pool, "test_window", 3600u64).await.unwrap();
        assert_eq!(value, 60);
    }

    #[tokio::test]
    async fn delete_removes_the_key() {
        let (_dir, pool) = test_pool().await;
        set_setting(&pool, "test_key", "value").await.unwrap();
        delete_setting(&pool, "test_key").await.unwrap();

        let value: Option<String> = get_setting(&pool, "test_key").await.unwrap();
        assert_eq!(value, None);
    }
}
