use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;

use crate::clock::Clock;
use crate::errors::KeyError;
use crate::models::key::{mask_token, IssueRequest, KeyRecord};
use crate::store::KeyStore;

pub const MIN_KEY_LENGTH: usize = 8;
pub const MAX_KEY_LENGTH: usize = 64;

/// Characters keys are drawn from.
pub const KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Regeneration attempts on a token collision before giving up.
const MAX_ATTEMPTS: usize = 5;

/// Mints new keys and inserts them, unbound, into the store.
#[derive(Clone)]
pub struct Issuer {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
}

impl Issuer {
    pub fn new(store: Arc<dyn KeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn issue(&self, req: IssueRequest) -> Result<KeyRecord, KeyError> {
        if !(MIN_KEY_LENGTH..=MAX_KEY_LENGTH).contains(&req.length) {
            return Err(KeyError::InvalidLength { length: req.length });
        }
        let ttl = validity(&req)?;
        let expires_at = expiry(self.clock.now(), ttl)?;

        if ttl <= Duration::zero() {
            tracing::warn!(
                days = req.days,
                hours = req.hours,
                minutes = req.minutes,
                "issuing key with non-positive duration; it is expired on arrival"
            );
        }

        for attempt in 1..=MAX_ATTEMPTS {
            let token = generate_token(req.length);
            match self.store.put(&token, expires_at).await {
                Ok(record) => {
                    tracing::info!(
                        key = %mask_token(&record.token),
                        expires_at = %record.expires_at,
                        "key issued"
                    );
                    return Ok(record);
                }
                Err(KeyError::DuplicateKey) => {
                    tracing::warn!(attempt, "generated key collided, regenerating");
                }
                Err(e) => return Err(e),
            }
        }

        Err(KeyError::DuplicateKey)
    }
}

/// Total validity. Individual components may be zero or negative, but not
/// all of them negative.
fn validity(req: &IssueRequest) -> Result<Duration, KeyError> {
    if req.days < 0 && req.hours < 0 && req.minutes < 0 {
        return Err(KeyError::InvalidDuration);
    }
    let days = Duration::try_days(req.days).ok_or(KeyError::InvalidDuration)?;
    let hours = Duration::try_hours(req.hours).ok_or(KeyError::InvalidDuration)?;
    let minutes = Duration::try_minutes(req.minutes).ok_or(KeyError::InvalidDuration)?;
    days.checked_add(&hours)
        .and_then(|d| d.checked_add(&minutes))
        .ok_or(KeyError::InvalidDuration)
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, KeyError> {
    now.checked_add_signed(ttl).ok_or(KeyError::InvalidDuration)
}

/// Uniformly sample `length` characters from [`KEY_ALPHABET`].
pub fn generate_token(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect()
}
