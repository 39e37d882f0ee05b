use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::KeyStore;
use crate::errors::KeyError;
use crate::models::key::{BindOutcome, KeyRecord};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    ///
    /// Tables created by the binding-less deployment gain the `hwid` column
    /// here; enforcement itself is a runtime setting.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    key: String,
    expires_at: DateTime<Utc>,
    hwid: Option<String>,
}

impl From<KeyRow> for KeyRecord {
    fn from(row: KeyRow) -> Self {
        KeyRecord {
            token: row.key,
            expires_at: row.expires_at,
            bound_hwid: row.hwid,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BindRow {
    previous: Option<String>,
}

fn unavailable(e: sqlx::Error) -> KeyError {
    tracing::error!(error = %e, "key store query failed");
    KeyError::StoreUnavailable(e.to_string())
}

#[async_trait]
impl KeyStore for PgStore {
    async fn put(&self, token: &str, expires_at: DateTime<Utc>) -> Result<KeyRecord, KeyError> {
        let row = sqlx::query_as::<_, KeyRow>(
            r#"INSERT INTO license_keys (key, expires_at)
               VALUES ($1, $2)
               RETURNING key, expires_at, hwid"#,
        )
        .bind(token)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => KeyError::DuplicateKey,
            _ => unavailable(e),
        })?;

        Ok(row.into())
    }

    async fn get(&self, token: &str) -> Result<Option<KeyRecord>, KeyError> {
        let row = sqlx::query_as::<_, KeyRow>(
            "SELECT key, expires_at, hwid FROM license_keys WHERE key = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(Into::into))
    }

    async fn set_binding(&self, token: &str, hwid: &str) -> Result<BindOutcome, KeyError> {
        // The row lock taken by FOR UPDATE makes read-previous and write a
        // single step; a concurrent binder waits and then sees our value.
        let row = sqlx::query_as::<_, BindRow>(
            r#"UPDATE license_keys AS k
               SET hwid = COALESCE(prev.hwid, $2)
               FROM (SELECT key, hwid FROM license_keys WHERE key = $1 FOR UPDATE) AS prev
               WHERE k.key = prev.key
               RETURNING prev.hwid AS previous"#,
        )
        .bind(token)
        .bind(hwid)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(match row {
            None => BindOutcome::NotFound,
            Some(BindRow { previous: None }) => BindOutcome::Bound,
            Some(BindRow { previous: Some(existing) }) => BindOutcome::AlreadyBound(existing),
        })
    }

    async fn clear_binding(&self, token: &str) -> Result<(), KeyError> {
        let result = sqlx::query("UPDATE license_keys SET hwid = NULL WHERE key = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(KeyError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<(), KeyError> {
        let result = sqlx::query("DELETE FROM license_keys WHERE key = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        if result.rows_affected() == 0 {
            return Err(KeyError::NotFound);
        }
        Ok(())
    }

    async fn delete_expired_before(&self, before: DateTime<Utc>) -> Result<u64, KeyError> {
        let result = sqlx::query("DELETE FROM license_keys WHERE expires_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(result.rows_affected())
    }

    async fn list_all(&self) -> Result<Vec<KeyRecord>, KeyError> {
        let rows = sqlx::query_as::<_, KeyRow>(
            "SELECT key, expires_at, hwid FROM license_keys ORDER BY expires_at ASC, key ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn connect() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn unique_token(prefix: &str) -> String {
        format!("{}{}", prefix, uuid::Uuid::new_v4().simple()).to_uppercase()
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
    async fn test_pg_binding_is_compare_and_set() {
        let store = connect().await;
        let token = unique_token("BIND");
        store.put(&token, Utc::now() + Duration::hours(1)).await.unwrap();

        assert_eq!(store.put(&token, Utc::now()).await, Err(KeyError::DuplicateKey));
        assert_eq!(store.set_binding(&token, "hw-a").await.unwrap(), BindOutcome::Bound);
        assert_eq!(
            store.set_binding(&token, "hw-b").await.unwrap(),
            BindOutcome::AlreadyBound("hw-a".into())
        );

        store.clear_binding(&token).await.unwrap();
        assert_eq!(store.set_binding(&token, "hw-b").await.unwrap(), BindOutcome::Bound);

        store.delete(&token).await.unwrap();
        assert_eq!(store.delete(&token).await, Err(KeyError::NotFound));
        assert_eq!(store.set_binding(&token, "hw-a").await.unwrap(), BindOutcome::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
    async fn test_pg_concurrent_first_use_binds_once() {
        let store = std::sync::Arc::new(connect().await);

        for round in 0..50 {
            let token = unique_token("RACE");
            store.put(&token, Utc::now() + Duration::hours(1)).await.unwrap();

            let contenders: Vec<_> = (0..4)
                .map(|i| {
                    let store = store.clone();
                    let token = token.clone();
                    let hwid = format!("hw-{}-{}", round, i);
                    tokio::spawn(async move {
                        let outcome = store.set_binding(&token, &hwid).await.unwrap();
                        (hwid, outcome)
                    })
                })
                .collect();

            let mut results = Vec::new();
            for handle in contenders {
                results.push(handle.await.unwrap());
            }

            let winners: Vec<&String> = results
                .iter()
                .filter(|(_, o)| *o == BindOutcome::Bound)
                .map(|(hwid, _)| hwid)
                .collect();
            assert_eq!(winners.len(), 1, "round {}: {:?}", round, results);
            for (hwid, outcome) in &results {
                if hwid != winners[0] {
                    assert_eq!(*outcome, BindOutcome::AlreadyBound(winners[0].clone()));
                }
            }

            let bound = store.get(&token).await.unwrap().unwrap().bound_hwid;
            assert_eq!(bound.as_ref(), Some(winners[0]));
            store.delete(&token).await.unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
    async fn test_pg_delete_expired_before() {
        let store = connect().await;
        // Far in the past so other rows in a shared database are untouched.
        let cutoff = DateTime::<Utc>::from_timestamp(1_000_000, 0).unwrap();
        let old = unique_token("OLD");
        let edge = unique_token("EDGE");
        store.put(&old, cutoff - Duration::seconds(1)).await.unwrap();
        store.put(&edge, cutoff).await.unwrap();

        assert_eq!(store.delete_expired_before(cutoff).await.unwrap(), 1);
        assert_eq!(store.delete_expired_before(cutoff).await.unwrap(), 0);
        assert!(store.get(&old).await.unwrap().is_none());
        assert!(store.get(&edge).await.unwrap().is_some());
        store.delete(&edge).await.unwrap();
    }
}
