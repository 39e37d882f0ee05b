use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::KeyStore;
use crate::errors::KeyError;
use crate::models::key::{BindOutcome, KeyRecord};

/// Process-local key store.
///
/// Every mutation holds the write lock for the whole logical operation, so a
/// sweep never observes a half-applied bind and two binds never interleave.
/// Contents do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: RwLock<HashMap<String, KeyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn put(&self, token: &str, expires_at: DateTime<Utc>) -> Result<KeyRecord, KeyError> {
        let mut keys = self.keys.write().await;
        if keys.contains_key(token) {
            return Err(KeyError::DuplicateKey);
        }
        let record = KeyRecord::new(token, expires_at);
        keys.insert(token.to_string(), record.clone());
        Ok(record)
    }

    async fn get(&self, token: &str) -> Result<Option<KeyRecord>, KeyError> {
        Ok(self.keys.read().await.get(token).cloned())
    }

    async fn set_binding(&self, token: &str, hwid: &str) -> Result<BindOutcome, KeyError> {
        let mut keys = self.keys.write().await;
        let Some(record) = keys.get_mut(token) else {
            return Ok(BindOutcome::NotFound);
        };
        match &record.bound_hwid {
            Some(existing) => Ok(BindOutcome::AlreadyBound(existing.clone())),
            None => {
                record.bound_hwid = Some(hwid.to_string());
                Ok(BindOutcome::Bound)
            }
        }
    }

    async fn clear_binding(&self, token: &str) -> Result<(), KeyError> {
        let mut keys = self.keys.write().await;
        let record = keys.get_mut(token).ok_or(KeyError::NotFound)?;
        record.bound_hwid = None;
        Ok(())
    }

    async fn delete(&self, token: &str) -> Result<(), KeyError> {
        self.keys
            .write()
            .await
            .remove(token)
            .map(|_| ())
            .ok_or(KeyError::NotFound)
    }

    async fn delete_expired_before(&self, before: DateTime<Utc>) -> Result<u64, KeyError> {
        let mut keys = self.keys.write().await;
        let prior = keys.len();
        keys.retain(|_, record| record.expires_at >= before);
        Ok((prior - keys.len()) as u64)
    }

    async fn list_all(&self) -> Result<Vec<KeyRecord>, KeyError> {
        let mut records: Vec<KeyRecord> = self.keys.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.token.cmp(&b.token)));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_put_rejects_duplicate_token() {
        let store = MemoryStore::new();
        let exp = Utc::now() + Duration::hours(1);
        store.put("AAAA1111", exp).await.unwrap();
        assert_eq!(store.put("AAAA1111", exp).await, Err(KeyError::DuplicateKey));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_set_binding_only_when_unbound() {
        let store = MemoryStore::new();
        store.put("TOKEN001", Utc::now() + Duration::hours(1)).await.unwrap();

        assert_eq!(store.set_binding("TOKEN001", "hw-a").await.unwrap(), BindOutcome::Bound);
        assert_eq!(
            store.set_binding("TOKEN001", "hw-b").await.unwrap(),
            BindOutcome::AlreadyBound("hw-a".into())
        );
        assert_eq!(
            store.get("TOKEN001").await.unwrap().unwrap().bound_hwid.as_deref(),
            Some("hw-a")
        );
        assert_eq!(store.set_binding("MISSING1", "hw-a").await.unwrap(), BindOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_clear_and_delete_report_not_found() {
        let store = MemoryStore::new();
        assert_eq!(store.clear_binding("NOPE0000").await, Err(KeyError::NotFound));
        assert_eq!(store.delete("NOPE0000").await, Err(KeyError::NotFound));

        store.put("TOKEN002", Utc::now()).await.unwrap();
        store.set_binding("TOKEN002", "hw").await.unwrap();
        store.clear_binding("TOKEN002").await.unwrap();
        assert!(store.get("TOKEN002").await.unwrap().unwrap().bound_hwid.is_none());
        store.delete("TOKEN002").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_expired_before_is_strict() {
        let store = MemoryStore::new();
        let t = Utc::now();
        store.put("PAST0000", t - Duration::seconds(1)).await.unwrap();
        store.put("EXACT000", t).await.unwrap();
        store.put("FUTURE00", t + Duration::seconds(1)).await.unwrap();

        assert_eq!(store.delete_expired_before(t).await.unwrap(), 1);
        assert_eq!(store.delete_expired_before(t).await.unwrap(), 0);

        let left: Vec<String> = store.list_all().await.unwrap().into_iter().map(|r| r.token).collect();
        assert_eq!(left, vec!["EXACT000".to_string(), "FUTURE00".to_string()]);
    }
}
