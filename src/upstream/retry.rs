// Retry/failover engine: error classification, reset-after parsing, and
// the two-layer retry loop (same-account attempts + account rotation).

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::pool::AccountPool;
use crate::token_service::TokenService;
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

/// Downstream-abort probe, checked before every attempt. Wraps whatever
/// signal the caller has: a channel-closed check, a watch flag.
pub struct AbortSignal(Box<dyn Fn() -> bool + Send + Sync>);

impl AbortSignal {
    pub fn new(probe: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self(Box::new(probe))
    }

    pub fn from_watch(rx: watch::Receiver<bool>) -> Self {
        Self::new(move || *rx.borrow())
    }

    pub fn fired(&self) -> bool {
        (self.0)()
    }
}

/// Upstream capacity refusals carry no structured code; these substrings
/// (plus HTTP 429) are the recognised set.
const CAPACITY_MARKERS: &[&str] = &[
    "exhausted your capacity on this model",
    "Resource has been exhausted",
    "No capacity available",
];

static RESET_AFTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)reset after (\d+)s").expect("valid reset-after regex"));

pub fn is_capacity_message(text: &str) -> bool {
    CAPACITY_MARKERS.iter().any(|marker| text.contains(marker))
}

/// `reset after Ns` plus one second of slack, in ms.
pub fn parse_reset_after_ms(text: &str) -> Option<u64> {
    RESET_AFTER_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(|secs| (secs + 1) * 1000)
}

/// Classify an upstream HTTP failure into the relay error taxonomy.
pub fn classify_upstream_error(status: u16, body: &str) -> RelayError {
    if body.contains("blockReason") {
        return RelayError::Blocked(body.to_string());
    }
    if status == 429 || is_capacity_message(body) {
        return RelayError::Capacity {
            message: body.to_string(),
            reset_after_ms: parse_reset_after_ms(body),
        };
    }
    if status == 401 {
        return RelayError::AuthExpired(body.to_string());
    }
    if (400..500).contains(&status) {
        return RelayError::Client {
            status,
            message: body.to_string(),
        };
    }
    RelayError::Upstream {
        status: Some(status),
        message: body.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub configured_retries: usize,
    pub same_account_retries: usize,
    pub same_account_retry_delay_ms: u64,
    pub account_switch_delay_ms: u64,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RelayConfig) -> Self {
        Self {
            configured_retries: cfg.retries,
            same_account_retries: cfg.same_account_retries.max(1),
            same_account_retry_delay_ms: cfg.same_account_retry_delay_ms,
            account_switch_delay_ms: cfg.account_switch_delay_ms,
            base_delay_ms: 1000,
        }
    }
}

/// Credentials handed to each attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub account_id: String,
    pub email: String,
    pub access_token: String,
    pub project_id: String,
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Completed(T),
    /// The downstream client went away; no further attempts were made.
    Aborted,
}

pub struct RetryEngine {
    pool: Arc<AccountPool>,
    tokens: Arc<TokenService>,
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(pool: Arc<AccountPool>, tokens: Arc<TokenService>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            tokens,
            policy,
        }
    }

    fn aborted(abort: &Option<AbortSignal>) -> bool {
        abort.as_ref().map(|sig| sig.fired()).unwrap_or(false)
    }

    /// Full retry: same-account attempts, then rotation across accounts.
    /// `abort` is checked before every attempt; once it fires the engine
    /// returns `Aborted` without touching account error state.
    pub async fn execute<T, F, Fut>(
        &self,
        model: &str,
        abort: Option<AbortSignal>,
        op: F,
    ) -> RelayResult<RetryOutcome<T>>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let available = self.pool.get_available_account_count();
        if available == 0 {
            return Err(RelayError::Pool("no active accounts".to_string()));
        }
        let max_switches = self
            .policy
            .configured_retries
            .max(available.saturating_sub(1));

        let mut last_err: Option<RelayError> = None;

        for switch in 0..=max_switches {
            if Self::aborted(&abort) {
                return Ok(RetryOutcome::Aborted);
            }

            let Some(entry) = self.pool.get_next_account(model).await else {
                if last_err.is_none() {
                    last_err = Some(RelayError::Pool(
                        "all accounts busy or cooling".to_string(),
                    ));
                }
                sleep(Duration::from_millis(self.policy.account_switch_delay_ms)).await;
                continue;
            };
            let account_id = entry.id.clone();

            let ctx = match self.prepare_context(&entry).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    self.pool
                        .mark_account_error(&account_id, &e.to_string())
                        .await;
                    self.pool.unlock_account(&account_id);
                    last_err = Some(e);
                    continue;
                }
            };

            let mut refreshed_inline = false;
            let mut attempt = 0usize;
            let mut ctx = ctx;
            let account_result: Option<RelayError> = loop {
                if Self::aborted(&abort) {
                    self.pool.unlock_account(&account_id);
                    return Ok(RetryOutcome::Aborted);
                }

                match op(ctx.clone()).await {
                    Ok(value) => {
                        self.pool.mark_capacity_recovered(&account_id, model);
                        self.pool.mark_account_success(&account_id).await;
                        self.pool.unlock_account(&account_id);
                        return Ok(RetryOutcome::Completed(value));
                    }
                    Err(RelayError::Aborted) => {
                        self.pool.unlock_account(&account_id);
                        return Ok(RetryOutcome::Aborted);
                    }
                    Err(RelayError::AuthExpired(msg)) if !refreshed_inline => {
                        // Singleflight refresh plus one inline retry.
                        refreshed_inline = true;
                        match self.tokens.force_refresh_token(&entry).await {
                            Some(token) => {
                                ctx.access_token = token;
                                continue;
                            }
                            None => break Some(RelayError::AuthExpired(msg)),
                        }
                    }
                    Err(e) => {
                        if e.is_capacity() {
                            self.pool.mark_capacity_limited(
                                &account_id,
                                model,
                                &e.to_string(),
                                e.reset_after_ms(),
                            );
                            break Some(e);
                        }
                        attempt += 1;
                        if attempt >= self.policy.same_account_retries || !e.can_retry() {
                            break Some(e);
                        }
                        last_err = Some(e);
                        sleep(Duration::from_millis(self.policy.same_account_retry_delay_ms))
                            .await;
                    }
                }
            };

            self.pool.unlock_account(&account_id);

            if let Some(e) = account_result {
                let is_capacity = e.is_capacity();
                let reset_after = e.reset_after_ms();
                let can_retry = e.can_retry();
                if !is_capacity && !matches!(e, RelayError::AuthExpired(_)) {
                    self.pool.mark_account_error(&account_id, &e.to_string()).await;
                }
                last_err = Some(e);

                if !can_retry {
                    return Err(last_err.expect("error just recorded"));
                }
                if switch < max_switches {
                    let delay = if is_capacity {
                        reset_after.unwrap_or(
                            self.policy.base_delay_ms * (switch as u64 + 1),
                        )
                    } else {
                        self.policy.account_switch_delay_ms
                    };
                    sleep(Duration::from_millis(delay)).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| RelayError::Pool("no account attempted".to_string())))
    }

    /// Capacity-only retry: one attempt per iteration, rotation only on
    /// capacity errors; anything else propagates immediately.
    pub async fn execute_capacity<T, F, Fut>(&self, model: &str, op: F) -> RelayResult<T>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let available = self.pool.get_available_account_count();
        if available == 0 {
            return Err(RelayError::Pool("no active accounts".to_string()));
        }
        let max_attempts = self
            .policy
            .configured_retries
            .max(available.saturating_sub(1))
            + 1;

        let mut last_err = RelayError::Pool("no account attempted".to_string());
        for attempt in 1..=max_attempts {
            let Some(entry) = self.pool.get_next_account(model).await else {
                last_err = RelayError::Pool("all accounts busy or cooling".to_string());
                break;
            };
            let account_id = entry.id.clone();

            let ctx = match self.prepare_context(&entry).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    self.pool
                        .mark_account_error(&account_id, &e.to_string())
                        .await;
                    self.pool.unlock_account(&account_id);
                    last_err = e;
                    continue;
                }
            };

            match op(ctx).await {
                Ok(value) => {
                    self.pool.mark_capacity_recovered(&account_id, model);
                    self.pool.mark_account_success(&account_id).await;
                    self.pool.unlock_account(&account_id);
                    return Ok(value);
                }
                Err(e) if e.is_capacity() => {
                    self.pool.mark_capacity_limited(
                        &account_id,
                        model,
                        &e.to_string(),
                        e.reset_after_ms(),
                    );
                    self.pool.unlock_account(&account_id);
                    let delay = e
                        .reset_after_ms()
                        .unwrap_or(self.policy.base_delay_ms * attempt as u64);
                    last_err = e;
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    self.pool.unlock_account(&account_id);
                    return Err(e);
                }
            }
        }

        Err(last_err)
    }

    async fn prepare_context(
        &self,
        entry: &Arc<crate::pool::AccountEntry>,
    ) -> RelayResult<AttemptContext> {
        let access_token = self.tokens.ensure_valid_token(entry).await?;
        let project_id = self.tokens.ensure_project_id(entry).await?;
        let email = entry.account.read().await.email.clone();
        Ok(AttemptContext {
            account_id: entry.id.clone(),
            email,
            access_token,
            project_id,
        })
    }
}
