//! Durable mapping from key token to [`KeyRecord`].
//!
//! The store is the only source of truth. Every method is atomic with respect
//! to every other method; in particular [`KeyStore::set_binding`] is a
//! compare-and-set so concurrent first-use validations cannot both bind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::KeyError;
use crate::models::key::{BindOutcome, KeyRecord};

pub mod memory;
pub mod postgres;

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Insert a new unbound record. Fails with `DuplicateKey` if the token exists.
    async fn put(&self, token: &str, expires_at: DateTime<Utc>) -> Result<KeyRecord, KeyError>;

    async fn get(&self, token: &str) -> Result<Option<KeyRecord>, KeyError>;

    /// Bind `hwid` only if the record is currently unbound.
    async fn set_binding(&self, token: &str, hwid: &str) -> Result<BindOutcome, KeyError>;

    /// Unconditionally remove any binding. Fails with `NotFound`.
    async fn clear_binding(&self, token: &str) -> Result<(), KeyError>;

    /// Remove a record. Fails with `NotFound`.
    async fn delete(&self, token: &str) -> Result<(), KeyError>;

    /// Remove every record with `expires_at < before`, returning how many went.
    async fn delete_expired_before(&self, before: DateTime<Utc>) -> Result<u64, KeyError>;

    /// Snapshot of all records, ordered by expiry.
    async fn list_all(&self) -> Result<Vec<KeyRecord>, KeyError>;
}
