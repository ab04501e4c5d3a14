// Token & quota service: OAuth refresh (singleflight per account),
// project/tier discovery, per-model quota polling, and the background
// schedulers that keep the pool warm.

use crate::account::{AccountStatus, ModelQuota};
use crate::common::model_mapping::exposed_upstream_models;
use crate::common::utils::now_ms;
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::oauth;
use crate::pool::{AccountEntry, AccountPool};
use crate::upstream::client::UpstreamClient;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

const TOKEN_REFRESH_INTERVAL_SECS: u64 = 50 * 60;
const QUOTA_SYNC_INTERVAL_SECS: u64 = 10 * 60;

pub const DEFAULT_TIER: &str = "free-tier";

/// Coalesce concurrent calls per key into one in-flight operation.
pub struct Singleflight<T: Clone + Send + Sync + 'static> {
    inflight: DashMap<String, Arc<OnceCell<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Singleflight<T> {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Run `op` for `key`, sharing the result with every concurrent caller.
    /// The slot clears once the operation resolves, so later calls run anew.
    pub async fn run<F, Fut>(&self, key: &str, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let value = cell.get_or_init(op).await.clone();
        self.inflight.remove_if(key, |_, v| Arc::ptr_eq(v, &cell));
        value
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TokenService {
    pool: Arc<AccountPool>,
    upstream: Arc<UpstreamClient>,
    cfg: Arc<RelayConfig>,
    http: reqwest::Client,
    refresh_flight: Singleflight<Option<String>>,
}

impl TokenService {
    pub fn new(pool: Arc<AccountPool>, upstream: Arc<UpstreamClient>, cfg: Arc<RelayConfig>) -> Self {
        Self {
            pool,
            upstream,
            cfg,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            refresh_flight: Singleflight::new(),
        }
    }

    /// Return a usable access token, refreshing when the current one is
    /// absent or within five minutes of expiry.
    pub async fn ensure_valid_token(&self, entry: &Arc<AccountEntry>) -> RelayResult<String> {
        {
            let account = entry.account.read().await;
            if !account.needs_refresh(now_ms()) {
                if let Some(token) = &account.access_token {
                    return Ok(token.clone());
                }
            }
        }
        match self.force_refresh_token(entry).await {
            Some(token) => Ok(token),
            None => Err(RelayError::OAuth(format!(
                "token refresh failed for account {}",
                entry.id
            ))),
        }
    }

    /// Singleflight refresh: concurrent 401 handlers observe one in-flight
    /// OAuth POST and share its result. None on failure.
    pub async fn force_refresh_token(&self, entry: &Arc<AccountEntry>) -> Option<String> {
        let key = entry.id.clone();
        let entry = entry.clone();
        self.refresh_flight
            .run(&key, || async move { self.do_refresh(&entry).await })
            .await
    }

    async fn do_refresh(&self, entry: &Arc<AccountEntry>) -> Option<String> {
        let refresh_token = entry.account.read().await.refresh_token.clone();
        match oauth::refresh_access_token(&self.http, &self.cfg, &refresh_token).await {
            Ok(token) => {
                let mut account = entry.account.write().await;
                account.access_token = Some(token.access_token.clone());
                account.token_expires_at = now_ms() + token.expires_in * 1000;
                if account.status == AccountStatus::Error {
                    account.status = AccountStatus::Active;
                    account.last_error = None;
                }
                drop(account);
                self.persist(entry).await;
                tracing::info!(account = %entry.id, "access token refreshed");
                Some(token.access_token)
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let mut account = entry.account.write().await;
                    account.status = AccountStatus::Error;
                    account.last_error = Some(message.clone());
                }
                self.persist(entry).await;
                tracing::error!(account = %entry.id, "token refresh failed: {}", message);
                None
            }
        }
    }

    /// Resolve the account's project id, discovering it via
    /// `loadCodeAssist` on first use.
    pub async fn ensure_project_id(&self, entry: &Arc<AccountEntry>) -> RelayResult<String> {
        if let Some(pid) = entry.account.read().await.project_id.clone() {
            return Ok(pid);
        }
        self.fetch_project_id(entry).await
    }

    pub async fn fetch_project_id(&self, entry: &Arc<AccountEntry>) -> RelayResult<String> {
        let token = self.ensure_valid_token(entry).await?;
        let data = self.upstream.load_code_assist(&token).await?;

        let tier = data
            .get("currentTier")
            .and_then(|t| t.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_TIER)
            .to_string();

        let project_id = match data
            .get("cloudaicompanionProject")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
        {
            Some(pid) => pid.to_string(),
            None => {
                // Account not provisioned upstream: a generated project id
                // keeps quota queries working.
                let mock = generate_mock_project_id();
                tracing::warn!(
                    account = %entry.id,
                    "no cloudaicompanionProject returned, using generated project id {}",
                    mock
                );
                mock
            }
        };

        {
            let mut account = entry.account.write().await;
            account.project_id = Some(project_id.clone());
            account.tier = Some(tier);
        }
        self.persist(entry).await;
        Ok(project_id)
    }

    /// Poll `fetchAvailableModels` and fold per-model quota into the
    /// account record. The account-level quota is the minimum over the
    /// models this relay exposes; an account with no quota info anywhere
    /// counts as exhausted, not as full.
    pub async fn fetch_quota_info(&self, entry: &Arc<AccountEntry>) -> RelayResult<()> {
        let token = self.ensure_valid_token(entry).await?;
        let project_id = self.ensure_project_id(entry).await.ok();
        let data = self
            .upstream
            .fetch_available_models(&token, project_id.as_deref())
            .await?;

        let exposed = exposed_upstream_models();
        let mut model_quotas: HashMap<String, ModelQuota> = HashMap::new();
        let mut account_quota: Option<f64> = None;
        let mut account_reset: i64 = 0;

        if let Some(models) = data.get("models").and_then(|m| m.as_object()) {
            for (name, info) in models {
                let Some(quota_info) = info.get("quotaInfo") else {
                    continue;
                };
                let remaining = quota_info
                    .get("remainingFraction")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                let reset_at_ms = quota_info
                    .get("resetTime")
                    .and_then(|v| v.as_str())
                    .and_then(parse_reset_time_ms)
                    .unwrap_or(0);

                model_quotas.insert(
                    name.clone(),
                    ModelQuota {
                        remaining,
                        reset_at_ms,
                    },
                );

                if exposed.contains(&name.as_str()) {
                    let is_min = account_quota.map(|q| remaining < q).unwrap_or(true);
                    if is_min {
                        account_quota = Some(remaining);
                        account_reset = reset_at_ms;
                    }
                }
            }
        }

        {
            let mut account = entry.account.write().await;
            account.model_quotas = model_quotas;
            account.quota_remaining = account_quota.unwrap_or(0.0);
            account.quota_reset_at = account_reset;
        }
        self.persist(entry).await;
        Ok(())
    }

    /// Background tickers: token refresh every 50 minutes, quota sync
    /// every 10. Per-account failures are isolated; startup never blocks.
    pub fn spawn_schedulers(self: &Arc<Self>) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                TOKEN_REFRESH_INTERVAL_SECS,
            ));
            ticker.tick().await; // immediate first tick consumed
            loop {
                ticker.tick().await;
                service.refresh_all_tokens().await;
            }
        });

        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(QUOTA_SYNC_INTERVAL_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.sync_all_quotas().await;
            }
        });
    }

    async fn refresh_all_tokens(&self) {
        for id in self.account_ids() {
            let Some(entry) = self.pool.get(&id) else { continue };
            if !entry.account.read().await.is_active() {
                continue;
            }
            if let Err(e) = self.ensure_valid_token(&entry).await {
                tracing::warn!(account = %id, "scheduled token refresh failed: {}", e);
            }
        }
    }

    async fn sync_all_quotas(&self) {
        for id in self.account_ids() {
            let Some(entry) = self.pool.get(&id) else { continue };
            if !entry.account.read().await.is_active() {
                continue;
            }
            if let Err(e) = self.fetch_quota_info(&entry).await {
                tracing::warn!(account = %id, "scheduled quota sync failed: {}", e);
            }
        }
    }

    /// Snapshot ids first so account locks are never held across I/O.
    fn account_ids(&self) -> Vec<String> {
        self.pool.ids()
    }

    async fn persist(&self, entry: &Arc<AccountEntry>) {
        let account = entry.account.read().await.clone();
        self.pool.persist_account(&account);
    }
}

/// RFC 3339 reset time to absolute ms.
fn parse_reset_time_ms(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// `{adjective}-{noun}-{5 base36 chars}`, used when the upstream grants no
/// real project.
pub fn generate_mock_project_id() -> String {
    use rand::Rng;

    let adjectives = ["useful", "bright", "swift", "calm", "bold"];
    let nouns = ["fuze", "wave", "spark", "flow", "core"];

    let mut rng = rand::thread_rng();
    let adj = adjectives[rng.gen_range(0..adjectives.len())];
    let noun = nouns[rng.gen_range(0..nouns.len())];
    let suffix: String = (0..5)
        .map(|_| {
            let chars = "abcdefghijklmnopqrstuvwxyz0123456789";
            chars
                .chars()
                .nth(rng.gen_range(0..chars.len()))
                .unwrap_or('x')
        })
        .collect();

    format!("{}-{}-{}", adj, noun, suffix)
}
