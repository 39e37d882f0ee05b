use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Notifier;

// ── Payload ──────────────────────────────────────────────────

/// Body accepted by both Discord (`content`) and Slack (`text`) incoming webhooks.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookMessage {
    pub content: String,
    pub text: String,
    /// ISO-8601 timestamp of when the message was produced.
    pub timestamp: String,
}

impl WebhookMessage {
    pub fn new(message: &str) -> Self {
        Self {
            content: message.to_string(),
            text: message.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ── HMAC Signing ─────────────────────────────────────────────

/// Compute HMAC-SHA256 of `payload` using `secret`.
/// Returns lowercase hex digest (e.g. "sha256=<hex>").
fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid hmac key: {}", e))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

// ── Webhook Notifier ─────────────────────────────────────────

/// Posts messages to a single webhook URL.
/// Supports:
/// - HMAC-SHA256 signing (X-Keygate-Signature header) when a secret is set
/// - retries with back-off (default 1s → 5s → 25s)
///
/// Without a URL every message is logged and dropped.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
    secret: Option<String>,
    backoff_secs: Vec<u64>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>, secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("keygate-webhook/1.0")
            .build()?;
        Ok(Self {
            client,
            url,
            secret,
            backoff_secs: vec![0, 1, 5, 25],
        })
    }

    /// Replace the retry schedule. Each entry is the delay before one attempt.
    pub fn with_backoff(mut self, backoff_secs: Vec<u64>) -> Self {
        self.backoff_secs = backoff_secs;
        self
    }

    async fn send(&self, url: &str, message: &WebhookMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let signature = match &self.secret {
            Some(s) => Some(hmac_sha256_hex(s, &payload)?),
            None => None,
        };

        for (attempt, &delay) in self.backoff_secs.iter().enumerate() {
            if delay > 0 {
                debug!(url, attempt, delay_secs = delay, "retrying webhook delivery");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }

            let mut req = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header("x-keygate-delivery-id", &delivery_id);

            if let Some(ref sig) = signature {
                req = req.header("x-keygate-signature", sig.as_str());
            }

            match req.body(payload.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        delivery_id = %delivery_id,
                        attempt,
                        status = %resp.status(),
                        "webhook delivered"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    warn!(
                        delivery_id = %delivery_id,
                        attempt,
                        status = %status,
                        body = %body,
                        "webhook delivery failed (non-2xx)"
                    );
                }
                Err(e) => {
                    warn!(
                        delivery_id = %delivery_id,
                        attempt,
                        error = %e,
                        "webhook request error"
                    );
                }
            }
        }

        anyhow::bail!(
            "webhook delivery failed after {} attempts",
            self.backoff_secs.len()
        )
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let Some(url) = self.url.as_deref() else {
            debug!(msg = message, "no notification webhook configured, skipping");
            return Ok(());
        };
        self.send(url, &WebhookMessage::new(message)).await
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_message_carries_both_fields() {
        let json = serde_json::to_value(WebhookMessage::new("hello")).unwrap();
        assert_eq!(json["content"], "hello");
        assert_eq!(json["text"], "hello");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_hmac_signature_deterministic() {
        let sig1 = hmac_sha256_hex("secret123", b"payload").unwrap();
        let sig2 = hmac_sha256_hex("secret123", b"payload").unwrap();
        assert_eq!(sig1, sig2);
        assert!(sig1.starts_with("sha256="));
        assert_ne!(sig1, hmac_sha256_hex("secret124", b"payload").unwrap());
    }

    #[tokio::test]
    async fn test_no_url_is_a_noop() {
        let notifier = WebhookNotifier::new(None, None).unwrap();
        notifier.notify("ignored").await.unwrap();
    }

    #[tokio::test]
    async fn test_delivers_signed_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists("x-keygate-signature"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            Some(format!("{}/hook", server.uri())),
            Some("s3cret".into()),
        )
        .unwrap();
        notifier.notify("Expired keys have been cleared").await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(Some(server.uri()), None)
            .unwrap()
            .with_backoff(vec![0, 0]);
        assert!(notifier.notify("boom").await.is_err());
    }
}
