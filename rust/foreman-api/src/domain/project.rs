//! Projects and worker credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration scope for tasks. A project maps 1:1 to one chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Filesystem path of the checkout on the worker host.
    pub local_path: String,
    /// Worker preferred for this project's tasks; resolution falls back to
    /// any online worker when it is gone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_agent_id: Option<String>,
    pub default_model: String,
    pub default_budget: f64,
    /// Chat channel this project is bound to; unique across projects.
    pub channel_id: String,
    /// Optional deploy-platform linkage, opaque to the fabric.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_target: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Credential a worker presents at authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// The opaque key string itself.
    pub key: String,
    /// Worker this key belongs to; the asserted agent id must match.
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// A key authenticates iff it is not revoked and not past expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at.map_or(true, |exp| exp > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> ApiKey {
        ApiKey {
            key: "fmk-test".into(),
            agent_id: "w1".into(),
            created_at: Utc::now(),
            expires_at: None,
            revoked: false,
            last_used_at: None,
        }
    }

    #[test]
    fn test_valid_key() {
        assert!(key().is_valid_at(Utc::now()));
    }

    #[test]
    fn test_revoked_key_rejected() {
        let mut k = key();
        k.revoked = true;
        assert!(!k.is_valid_at(Utc::now()));
    }

    #[test]
    fn test_expired_key_rejected() {
        let mut k = key();
        k.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(!k.is_valid_at(Utc::now()));
        k.expires_at = Some(Utc::now() + Duration::hours(1));
        assert!(k.is_valid_at(Utc::now()));
    }
}
