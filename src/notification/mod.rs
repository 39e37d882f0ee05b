//! Outbound notifications (sweep reports).

use async_trait::async_trait;

pub mod webhook;

/// A channel that accepts human-readable messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> anyhow::Result<()>;
}
