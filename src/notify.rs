// =============================================================================
// Notifier capability — delivers MFA codes out-of-band
// =============================================================================
//
// Delivery failure is never fatal: the code stays valid and the caller can
// read it from wherever the production notifier lands it.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish_code(
        &self,
        user_id: &str,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

/// Log-only notifier: announces that a code was issued without revealing
/// it. The default when no push channel is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish_code(
        &self,
        user_id: &str,
        _code: &str,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        info!(user_id, %expires_at, "MFA code issued");
        Ok(())
    }
}

/// Captures published codes for assertions in tests.
#[derive(Default)]
pub struct RecordingNotifier {
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish_code(
        &self,
        user_id: &str,
        code: &str,
        _expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.published
            .lock()
            .push((user_id.to_string(), code.to_string()));
        Ok(())
    }
}
