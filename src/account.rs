use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Refresh when the access token expires within this window.
pub const TOKEN_REFRESH_WINDOW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Disabled,
    Error,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Disabled => "disabled",
            AccountStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "disabled" => AccountStatus::Disabled,
            "error" => AccountStatus::Error,
            _ => AccountStatus::Active,
        }
    }
}

/// Per-model quota snapshot from `fetchAvailableModels`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelQuota {
    /// Remaining fraction in [0, 1].
    pub remaining: f64,
    /// Absolute reset timestamp in ms (0 when unknown).
    pub reset_at_ms: i64,
}

/// One OAuth-backed upstream account.
///
/// The refresh token is the source of truth; `access_token` may be absent
/// or stale and is rewritten by the token service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub refresh_token: String,
    pub access_token: Option<String>,
    /// Absolute expiry in ms; 0 when no token has been minted yet.
    pub token_expires_at: i64,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    pub status: AccountStatus,
    pub last_error: Option<String>,
    pub last_used_at: i64,
    pub error_count: u32,
    /// Account-level quota: minimum over the exposed models.
    pub quota_remaining: f64,
    pub quota_reset_at: i64,
    pub model_quotas: HashMap<String, ModelQuota>,
}

impl Account {
    pub fn new(id: String, email: String, refresh_token: String) -> Self {
        Self {
            id,
            email,
            refresh_token,
            access_token: None,
            token_expires_at: 0,
            project_id: None,
            tier: None,
            status: AccountStatus::Active,
            last_error: None,
            last_used_at: 0,
            error_count: 0,
            quota_remaining: 1.0,
            quota_reset_at: 0,
            model_quotas: HashMap::new(),
        }
    }

    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        self.access_token.is_none() || self.token_expires_at - now_ms < TOKEN_REFRESH_WINDOW_MS
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_window() {
        let mut acc = Account::new("a1".into(), "a@x".into(), "rt".into());
        let now = 1_000_000_000;
        assert!(acc.needs_refresh(now));

        acc.access_token = Some("at".into());
        acc.token_expires_at = now + TOKEN_REFRESH_WINDOW_MS + 1;
        assert!(!acc.needs_refresh(now));

        acc.token_expires_at = now + TOKEN_REFRESH_WINDOW_MS - 1;
        assert!(acc.needs_refresh(now));
    }

    #[test]
    fn status_round_trip() {
        for status in [
            AccountStatus::Active,
            AccountStatus::Disabled,
            AccountStatus::Error,
        ] {
            assert_eq!(AccountStatus::parse(status.as_str()), status);
        }
    }
}
