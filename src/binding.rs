//! First-use hardware binding.
//!
//! `validate` is a deterministic function of stored state and the clock:
//! a missing key, an expired key and a hardware mismatch are ordinary
//! outcomes returned as [`Decision`], never errors. Only a store failure
//! surfaces as `Err`.

use std::sync::Arc;

use crate::clock::Clock;
use crate::errors::KeyError;
use crate::models::key::{mask_token, AllowReason, BindOutcome, Decision};
use crate::store::KeyStore;

#[derive(Clone)]
pub struct BindingEngine {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    enforce_hwid: bool,
}

impl BindingEngine {
    pub fn new(store: Arc<dyn KeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            enforce_hwid: true,
        }
    }

    /// Disable binding: valid keys are accepted from any hardware and no
    /// binding is recorded.
    pub fn with_hwid_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_hwid = enforce;
        self
    }

    pub fn enforces_hwid(&self) -> bool {
        self.enforce_hwid
    }

    pub async fn validate(&self, token: &str, hwid: &str) -> Result<Decision, KeyError> {
        let decision = self.decide(token, hwid).await?;
        tracing::debug!(
            key = %mask_token(token),
            decision = decision.label(),
            allowed = decision.is_allowed(),
            "key validated"
        );
        Ok(decision)
    }

    async fn decide(&self, token: &str, hwid: &str) -> Result<Decision, KeyError> {
        let Some(record) = self.store.get(token).await? else {
            return Ok(Decision::NotFound);
        };

        // Expired records stay put; removal belongs to the sweeper.
        if record.is_expired_at(self.clock.now()) {
            return Ok(Decision::Expired);
        }

        if !self.enforce_hwid {
            return Ok(Decision::Allowed(AllowReason::Verified));
        }

        match record.bound_hwid {
            None => match self.store.set_binding(token, hwid).await? {
                BindOutcome::Bound => {
                    tracing::info!(key = %mask_token(token), "hardware id linked to key");
                    Ok(Decision::Allowed(AllowReason::Linked))
                }
                // Lost a race with another first use.
                BindOutcome::AlreadyBound(winner) => Ok(compare(&winner, hwid)),
                BindOutcome::NotFound => Ok(Decision::NotFound),
            },
            Some(bound) => Ok(compare(&bound, hwid)),
        }
    }
}

fn compare(bound: &str, hwid: &str) -> Decision {
    if bound == hwid {
        Decision::Allowed(AllowReason::Verified)
    } else {
        Decision::HwidMismatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;
    use chrono::{Duration, Utc};

    fn engine() -> (BindingEngine, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (BindingEngine::new(store.clone(), clock.clone()), store, clock)
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let (engine, _, _) = engine();
        assert_eq!(engine.validate("NOSUCHKEY", "hw").await.unwrap(), Decision::NotFound);
    }

    #[tokio::test]
    async fn test_link_then_verify_then_mismatch() {
        let (engine, store, clock) = engine();
        store.put("KEY00001", clock.now() + Duration::hours(1)).await.unwrap();

        assert_eq!(
            engine.validate("KEY00001", "hw-a").await.unwrap(),
            Decision::Allowed(AllowReason::Linked)
        );
        assert_eq!(
            store.get("KEY00001").await.unwrap().unwrap().bound_hwid.as_deref(),
            Some("hw-a")
        );
        assert_eq!(
            engine.validate("KEY00001", "hw-a").await.unwrap(),
            Decision::Allowed(AllowReason::Verified)
        );
        assert_eq!(engine.validate("KEY00001", "hw-b").await.unwrap(), Decision::HwidMismatch);
        assert_eq!(
            store.get("KEY00001").await.unwrap().unwrap().bound_hwid.as_deref(),
            Some("hw-a")
        );
    }

    #[tokio::test]
    async fn test_expired_key_is_kept_and_not_bound() {
        let (engine, store, clock) = engine();
        store.put("KEY00002", clock.now()).await.unwrap();

        assert_eq!(engine.validate("KEY00002", "hw-a").await.unwrap(), Decision::Expired);
        let record = store.get("KEY00002").await.unwrap().expect("record must survive validate");
        assert!(record.bound_hwid.is_none());
    }

    #[tokio::test]
    async fn test_expired_regardless_of_binding() {
        let (engine, store, clock) = engine();
        store.put("KEY00003", clock.now() + Duration::minutes(1)).await.unwrap();
        engine.validate("KEY00003", "hw-a").await.unwrap();

        clock.advance(Duration::minutes(1));
        assert_eq!(engine.validate("KEY00003", "hw-a").await.unwrap(), Decision::Expired);
        assert_eq!(engine.validate("KEY00003", "hw-b").await.unwrap(), Decision::Expired);
    }

    #[tokio::test]
    async fn test_binding_disabled_accepts_any_hwid() {
        let (engine, store, clock) = engine();
        let engine = engine.with_hwid_enforcement(false);
        store.put("KEY00004", clock.now() + Duration::hours(1)).await.unwrap();

        assert_eq!(
            engine.validate("KEY00004", "hw-a").await.unwrap(),
            Decision::Allowed(AllowReason::Verified)
        );
        assert_eq!(
            engine.validate("KEY00004", "").await.unwrap(),
            Decision::Allowed(AllowReason::Verified)
        );
        assert!(store.get("KEY00004").await.unwrap().unwrap().bound_hwid.is_none());
    }
}
