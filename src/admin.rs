//! Administrative operations: revoke, reset binding, list, check.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::errors::KeyError;
use crate::models::key::{mask_token, KeyRecord, KeyStatus, EXPIRY_FORMAT};
use crate::store::KeyStore;

#[derive(Clone)]
pub struct AdminOps {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
}

impl AdminOps {
    pub fn new(store: Arc<dyn KeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn revoke(&self, token: &str) -> Result<(), KeyError> {
        self.store.delete(token).await?;
        tracing::info!(key = %mask_token(token), "key revoked");
        Ok(())
    }

    pub async fn reset_binding(&self, token: &str) -> Result<(), KeyError> {
        self.store.clear_binding(token).await?;
        tracing::info!(key = %mask_token(token), "hardware binding reset");
        Ok(())
    }

    pub async fn list(&self) -> Result<KeyListing, KeyError> {
        Ok(KeyListing {
            keys: self.store.list_all().await?,
            as_of: self.clock.now(),
        })
    }

    /// Read-only: never binds and never deletes.
    pub async fn check_status(&self, token: &str) -> Result<KeyStatus, KeyError> {
        let status = match self.store.get(token).await? {
            None => KeyStatus::NotFound,
            Some(record) if record.is_expired_at(self.clock.now()) => KeyStatus::Expired {
                expires_at: record.expires_at,
            },
            Some(record) => KeyStatus::Valid {
                expires_at: record.expires_at,
            },
        };
        Ok(status)
    }
}

/// Snapshot of every stored key, rendered one per line for operators.
#[derive(Debug, Clone, Serialize)]
pub struct KeyListing {
    pub keys: Vec<KeyRecord>,
    pub as_of: DateTime<Utc>,
}

impl fmt::Display for KeyListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.keys.is_empty() {
            return f.write_str("No keys found.");
        }
        f.write_str("Keys:")?;
        for key in &self.keys {
            let marker = if key.is_expired_at(self.as_of) { " (expired)" } else { "" };
            write!(
                f,
                "\n{} - Expires: {}{} - HWID: {}",
                key.token,
                key.expires_at.format(EXPIRY_FORMAT),
                marker,
                key.bound_hwid.as_deref().unwrap_or("unbound"),
            )?;
        }
        Ok(())
    }
}
