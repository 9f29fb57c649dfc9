// =============================================================================
// MFA service — 6-digit challenge gating for notionally-large executions
// =============================================================================
//
// A challenge binds one code to one trade id for five minutes. The
// `verified` flag is write-once: replaying a consumed code fails with
// "already used". Expired challenges are garbage-collected periodically.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{info, warn};

use crate::errors::StoreError;
use crate::notify::Notifier;
use crate::records::MfaChallenge;
use crate::store::Store;

/// Challenge lifetime.
const CHALLENGE_TTL_MINS: i64 = 5;

/// Outcome of one MFA check at the execution endpoint. All variants are
/// normal control flow, never errors.
#[derive(Debug, Clone, PartialEq)]
pub enum MfaCheck {
    /// A challenge was created (or is still outstanding); the caller must
    /// retry with the code.
    ChallengeIssued { expires_at: DateTime<Utc> },
    /// The supplied code matched an active challenge.
    Verified,
    /// The supplied code was rejected.
    Failed { reason: String },
}

pub struct MfaService {
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
}

impl MfaService {
    pub fn new(store: Arc<Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Run the MFA handshake for `trade_id`.
    ///
    /// With no code supplied: issue (or re-surface) a challenge. With a
    /// code: validate it against the bound challenge.
    pub async fn check(
        &self,
        trade_id: &str,
        user_id: &str,
        trade_details: serde_json::Value,
        supplied_code: Option<&str>,
    ) -> Result<MfaCheck, StoreError> {
        let now = Utc::now();

        match supplied_code {
            None => {
                // Re-surface an outstanding challenge instead of churning
                // codes on repeated attempts.
                if let Some(existing) = self.store.find_mfa(trade_id).await? {
                    if !existing.verified && now <= existing.expires_at {
                        return Ok(MfaCheck::ChallengeIssued {
                            expires_at: existing.expires_at,
                        });
                    }
                }
                let challenge = self.issue(trade_id, user_id, trade_details).await?;
                Ok(MfaCheck::ChallengeIssued {
                    expires_at: challenge.expires_at,
                })
            }

            Some(code) => {
                let Some(challenge) = self.store.find_mfa(trade_id).await? else {
                    return Ok(MfaCheck::Failed {
                        reason: "no active challenge".to_string(),
                    });
                };
                if challenge.verified {
                    return Ok(MfaCheck::Failed {
                        reason: "already used".to_string(),
                    });
                }
                // Valid through expires_at; invalid from the next millisecond.
                if now > challenge.expires_at {
                    return Ok(MfaCheck::Failed {
                        reason: "expired".to_string(),
                    });
                }
                if challenge.code != code {
                    return Ok(MfaCheck::Failed {
                        reason: "invalid code".to_string(),
                    });
                }
                // Write-once; a concurrent verifier losing the race sees
                // "already used".
                if !self.store.mark_mfa_verified(trade_id).await? {
                    return Ok(MfaCheck::Failed {
                        reason: "already used".to_string(),
                    });
                }
                info!(trade_id, "MFA challenge verified");
                Ok(MfaCheck::Verified)
            }
        }
    }

    /// Remove expired challenges; returns how many were dropped.
    pub async fn gc(&self) -> Result<usize, StoreError> {
        let removed = self.store.gc_expired_mfa(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "expired MFA challenges collected");
        }
        Ok(removed)
    }

    async fn issue(
        &self,
        trade_id: &str,
        user_id: &str,
        trade_details: serde_json::Value,
    ) -> Result<MfaChallenge, StoreError> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        let now = Utc::now();
        let challenge = MfaChallenge {
            trade_id: trade_id.to_string(),
            user_id: user_id.to_string(),
            code: code.clone(),
            created_at: now,
            expires_at: now + Duration::minutes(CHALLENGE_TTL_MINS),
            verified: false,
            trade_details,
        };
        self.store.insert_mfa(&challenge).await?;

        // Delivery failure is non-fatal; the code remains valid.
        if let Err(e) = self
            .notifier
            .publish_code(user_id, &code, challenge.expires_at)
            .await
        {
            warn!(trade_id, error = %e, "MFA code delivery failed — code remains valid");
        }
        info!(trade_id, expires_at = %challenge.expires_at, "MFA challenge issued");
        Ok(challenge)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;

    async fn service() -> (MfaService, Arc<Store>, Arc<RecordingNotifier>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_async(dir.path().join("t.db").to_str().unwrap()).await);
        let notifier = Arc::new(RecordingNotifier::default());
        let svc = MfaService::new(store.clone(), notifier.clone());
        (svc, store, notifier, dir)
    }

    #[tokio::test]
    async fn handshake_issues_then_verifies_then_rejects_reuse() {
        let (svc, _store, notifier, _dir) = service().await;

        // First attempt without a code issues a challenge.
        let first = svc
            .check("trade-1", "owner", serde_json::json!({"usd": 500}), None)
            .await
            .unwrap();
        let MfaCheck::ChallengeIssued { expires_at } = first else {
            panic!("expected a challenge");
        };
        assert!(expires_at > Utc::now());

        let code = notifier.published()[0].1.clone();
        assert_eq!(code.len(), 6);

        // Correct code verifies.
        let verified = svc
            .check("trade-1", "owner", serde_json::Value::Null, Some(&code))
            .await
            .unwrap();
        assert_eq!(verified, MfaCheck::Verified);

        // Replaying the consumed code fails.
        let replay = svc
            .check("trade-1", "owner", serde_json::Value::Null, Some(&code))
            .await
            .unwrap();
        assert_eq!(
            replay,
            MfaCheck::Failed {
                reason: "already used".to_string()
            }
        );
    }

    #[tokio::test]
    async fn wrong_code_is_rejected_and_challenge_survives() {
        let (svc, _store, notifier, _dir) = service().await;
        svc.check("trade-2", "owner", serde_json::Value::Null, None)
            .await
            .unwrap();
        let real = notifier.published()[0].1.clone();
        let wrong = if real == "000000" { "000001" } else { "000000" };

        let res = svc
            .check("trade-2", "owner", serde_json::Value::Null, Some(wrong))
            .await
            .unwrap();
        assert_eq!(
            res,
            MfaCheck::Failed {
                reason: "invalid code".to_string()
            }
        );

        // The real code still works afterwards.
        let ok = svc
            .check("trade-2", "owner", serde_json::Value::Null, Some(&real))
            .await
            .unwrap();
        assert_eq!(ok, MfaCheck::Verified);
    }

    #[tokio::test]
    async fn code_is_invalid_after_expiry() {
        let (svc, store, _notifier, _dir) = service().await;
        let expired = MfaChallenge {
            trade_id: "trade-3".to_string(),
            user_id: "owner".to_string(),
            code: "123456".to_string(),
            created_at: Utc::now() - Duration::minutes(6),
            expires_at: Utc::now() - Duration::milliseconds(1),
            verified: false,
            trade_details: serde_json::Value::Null,
        };
        store.insert_mfa(&expired).await.unwrap();

        let res = svc
            .check("trade-3", "owner", serde_json::Value::Null, Some("123456"))
            .await
            .unwrap();
        assert_eq!(
            res,
            MfaCheck::Failed {
                reason: "expired".to_string()
            }
        );
    }

    #[tokio::test]
    async fn code_without_challenge_is_rejected() {
        let (svc, _store, _notifier, _dir) = service().await;
        let res = svc
            .check("ghost", "owner", serde_json::Value::Null, Some("123456"))
            .await
            .unwrap();
        assert_eq!(
            res,
            MfaCheck::Failed {
                reason: "no active challenge".to_string()
            }
        );
    }

    #[tokio::test]
    async fn outstanding_challenge_is_resurfaced_not_regenerated() {
        let (svc, _store, notifier, _dir) = service().await;
        svc.check("trade-4", "owner", serde_json::Value::Null, None)
            .await
            .unwrap();
        svc.check("trade-4", "owner", serde_json::Value::Null, None)
            .await
            .unwrap();
        // Only one code was ever delivered.
        assert_eq!(notifier.published().len(), 1);
    }

    #[tokio::test]
    async fn gc_drops_only_expired_challenges() {
        let (svc, store, _notifier, _dir) = service().await;
        svc.check("live", "owner", serde_json::Value::Null, None)
            .await
            .unwrap();
        store
            .insert_mfa(&MfaChallenge {
                trade_id: "stale".to_string(),
                user_id: "owner".to_string(),
                code: "999999".to_string(),
                created_at: Utc::now() - Duration::minutes(10),
                expires_at: Utc::now() - Duration::minutes(5),
                verified: false,
                trade_details: serde_json::Value::Null,
            })
            .await
            .unwrap();

        assert_eq!(svc.gc().await.unwrap(), 1);
        assert!(store.find_mfa("live").await.unwrap().is_some());
        assert!(store.find_mfa("stale").await.unwrap().is_none());
    }
}
