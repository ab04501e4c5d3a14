// Account pool: selection, per-account locking, per-(account,model)
// capacity cooldowns, and the per-model concurrency gate.

use crate::account::{Account, AccountStatus};
use crate::common::utils::now_ms;
use crate::storage::Store;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use tokio::sync::RwLock;

/// Cooldown applied when no reset-after hint is available.
pub const BASELINE_COOLDOWN_MS: i64 = 60_000;

pub struct AccountEntry {
    pub id: String,
    pub account: RwLock<Account>,
    busy: AtomicBool,
}

impl AccountEntry {
    fn new(account: Account) -> Arc<Self> {
        Arc::new(Self {
            id: account.id.clone(),
            account: RwLock::new(account),
            busy: AtomicBool::new(false),
        })
    }

    fn try_lock(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_locked(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct Cooldown {
    pub cooling_until_ms: i64,
    pub last_reason: String,
}

pub struct AccountPool {
    entries: DashMap<String, Arc<AccountEntry>>,
    /// Selection order; DashMap iteration order is unstable.
    order: StdRwLock<Vec<String>>,
    cooldowns: DashMap<(String, String), Cooldown>,
    rr_index: AtomicUsize,
    store: Option<Arc<Store>>,
    gate: Arc<ConcurrencyGate>,
}

impl AccountPool {
    pub fn new(store: Option<Arc<Store>>, max_concurrent_per_model: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: StdRwLock::new(Vec::new()),
            cooldowns: DashMap::new(),
            rr_index: AtomicUsize::new(0),
            store,
            gate: Arc::new(ConcurrencyGate::new(max_concurrent_per_model)),
        }
    }

    /// Load the persisted roster. Returns the number of accounts loaded.
    pub fn load_from_store(&self) -> usize {
        let Some(store) = &self.store else { return 0 };
        match store.list_accounts() {
            Ok(accounts) => {
                let count = accounts.len();
                for account in accounts {
                    self.insert_account(account);
                }
                count
            }
            Err(e) => {
                tracing::warn!("failed to load accounts from store: {}", e);
                0
            }
        }
    }

    pub fn insert_account(&self, account: Account) {
        let id = account.id.clone();
        self.entries.insert(id.clone(), AccountEntry::new(account));
        let mut order = self.order.write().expect("order lock poisoned");
        if !order.contains(&id) {
            order.push(id);
        }
    }

    pub fn remove_account(&self, id: &str) {
        self.entries.remove(id);
        self.order
            .write()
            .expect("order lock poisoned")
            .retain(|x| x != id);
        self.cooldowns.retain(|(aid, _), _| aid != id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<AccountEntry>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.order.read().expect("order lock poisoned").clone()
    }

    pub fn persist_account(&self, account: &Account) {
        self.persist(account);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accounts the retry engine could still rotate to.
    pub fn get_available_account_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                e.value()
                    .account
                    .try_read()
                    .map(|a| a.is_active())
                    .unwrap_or(false)
            })
            .count()
    }

    fn is_cooling(&self, id: &str, model: &str, now: i64) -> bool {
        match self.cooldowns.get(&(id.to_string(), model.to_string())) {
            Some(cd) => cd.cooling_until_ms > now,
            None => false,
        }
    }

    /// Select and lock the next account for `model`.
    ///
    /// Preference order: round-robin over active, unlocked, uncooled
    /// accounts; else the unlocked one whose cooldown expires first; else
    /// any active unlocked one.
    pub async fn get_next_account(&self, model: &str) -> Option<Arc<AccountEntry>> {
        let order: Vec<String> = self.order.read().expect("order lock poisoned").clone();
        if order.is_empty() {
            return None;
        }
        let now = now_ms();
        let start = self.rr_index.fetch_add(1, Ordering::SeqCst) % order.len();

        // Pass 1: healthy and not cooling.
        for offset in 0..order.len() {
            let id = &order[(start + offset) % order.len()];
            let Some(entry) = self.get(id) else { continue };
            if entry.is_locked() || self.is_cooling(id, model, now) {
                continue;
            }
            if !entry.account.read().await.is_active() {
                continue;
            }
            if entry.try_lock() {
                return Some(entry);
            }
        }

        // Pass 2: everything for this model is cooling; take the one whose
        // window ends first.
        let mut best: Option<(Arc<AccountEntry>, i64)> = None;
        for id in &order {
            let Some(entry) = self.get(id) else { continue };
            if entry.is_locked() || !entry.account.read().await.is_active() {
                continue;
            }
            let until = self
                .cooldowns
                .get(&(id.clone(), model.to_string()))
                .map(|cd| cd.cooling_until_ms)
                .unwrap_or(0);
            if best.as_ref().map(|(_, t)| until < *t).unwrap_or(true) {
                best = Some((entry, until));
            }
        }
        if let Some((entry, _)) = best {
            if entry.try_lock() {
                return Some(entry);
            }
        }

        None
    }

    pub fn unlock_account(&self, id: &str) {
        if let Some(entry) = self.get(id) {
            entry.busy.store(false, Ordering::Release);
        }
    }

    pub async fn mark_account_success(&self, id: &str) {
        let Some(entry) = self.get(id) else { return };
        {
            let mut account = entry.account.write().await;
            account.last_used_at = now_ms();
            account.error_count = 0;
            account.last_error = None;
            self.persist(&account);
        }
    }

    pub async fn mark_account_error(&self, id: &str, message: &str) {
        let Some(entry) = self.get(id) else { return };
        {
            let mut account = entry.account.write().await;
            account.error_count = account.error_count.saturating_add(1);
            account.last_error = Some(message.to_string());
            self.persist(&account);
        }
        tracing::warn!(account = id, "account error recorded: {}", message);
    }

    pub async fn set_account_status(&self, id: &str, status: AccountStatus, message: Option<&str>) {
        let Some(entry) = self.get(id) else { return };
        let mut account = entry.account.write().await;
        account.status = status;
        if let Some(msg) = message {
            account.last_error = Some(msg.to_string());
        }
        self.persist(&account);
    }

    /// Capacity exhaustion reported for (account, model): start a cooldown
    /// window. `reset_after_ms` comes from the upstream error when present.
    pub fn mark_capacity_limited(
        &self,
        id: &str,
        model: &str,
        message: &str,
        reset_after_ms: Option<u64>,
    ) {
        let until = now_ms() + reset_after_ms.map(|ms| ms as i64).unwrap_or(BASELINE_COOLDOWN_MS);
        self.cooldowns.insert(
            (id.to_string(), model.to_string()),
            Cooldown {
                cooling_until_ms: until,
                last_reason: message.to_string(),
            },
        );
        tracing::warn!(
            account = id,
            model = model,
            cooling_until_ms = until,
            "capacity cooldown set"
        );
    }

    /// First success after a cooldown clears it.
    pub fn mark_capacity_recovered(&self, id: &str, model: &str) {
        self.cooldowns
            .remove(&(id.to_string(), model.to_string()));
    }

    pub fn cooldown_for(&self, id: &str, model: &str) -> Option<Cooldown> {
        self.cooldowns
            .get(&(id.to_string(), model.to_string()))
            .map(|cd| cd.clone())
    }

    pub fn gate_handle(&self) -> Arc<ConcurrencyGate> {
        self.gate.clone()
    }

    fn persist(&self, account: &Account) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_account(account) {
                tracing::warn!("failed to persist account {}: {}", account.id, e);
            }
        }
    }
}

/// Per-model in-flight request counter. Cap 0 disables the gate.
pub struct ConcurrencyGate {
    in_flight: Mutex<std::collections::HashMap<String, usize>>,
    cap: usize,
}

impl ConcurrencyGate {
    pub fn new(cap: usize) -> Self {
        Self {
            in_flight: Mutex::new(std::collections::HashMap::new()),
            cap,
        }
    }

    /// Returns None when the model is saturated; the caller surfaces that
    /// as a retryable 429 capacity event.
    pub fn acquire_model_slot(self: &Arc<Self>, model: &str) -> Option<ModelSlotGuard> {
        if self.cap == 0 {
            return Some(ModelSlotGuard {
                gate: None,
                model: model.to_string(),
            });
        }
        let mut in_flight = self.in_flight.lock().expect("gate lock poisoned");
        let count = in_flight.entry(model.to_string()).or_insert(0);
        if *count >= self.cap {
            return None;
        }
        *count += 1;
        Some(ModelSlotGuard {
            gate: Some(Arc::clone(self)),
            model: model.to_string(),
        })
    }

    pub fn in_flight(&self, model: &str) -> usize {
        self.in_flight
            .lock()
            .expect("gate lock poisoned")
            .get(model)
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, model: &str) {
        let mut in_flight = self.in_flight.lock().expect("gate lock poisoned");
        if let Some(count) = in_flight.get_mut(model) {
            *count = count.saturating_sub(1);
        }
    }
}

pub struct ModelSlotGuard {
    gate: Option<Arc<ConcurrencyGate>>,
    model: String,
}

impl Drop for ModelSlotGuard {
    fn drop(&mut self) {
        if let Some(gate) = &self.gate {
            gate.release(&self.model);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str) -> Account {
        Account::new(id.to_string(), format!("{}@example.com", id), "rt".to_string())
    }

    fn pool_with(ids: &[&str]) -> AccountPool {
        let pool = AccountPool::new(None, 0);
        for id in ids {
            pool.insert_account(account(id));
        }
        pool
    }

    #[tokio::test]
    async fn selection_locks_and_rotates() {
        let pool = pool_with(&["a", "b"]);

        let first = pool.get_next_account("m").await.unwrap();
        let second = pool.get_next_account("m").await.unwrap();
        assert_ne!(first.id, second.id);

        // Both locked: nothing left.
        assert!(pool.get_next_account("m").await.is_none());

        pool.unlock_account(&first.id);
        let third = pool.get_next_account("m").await.unwrap();
        assert_eq!(third.id, first.id);
    }

    #[tokio::test]
    async fn cooldown_skips_account_until_expiry() {
        let pool = pool_with(&["a", "b"]);
        pool.mark_capacity_limited("a", "m", "exhausted", Some(60_000));

        // Only b is eligible for model m.
        let picked = pool.get_next_account("m").await.unwrap();
        assert_eq!(picked.id, "b");
        pool.unlock_account("b");

        // Other models are unaffected.
        let picked = pool.get_next_account("other").await.unwrap();
        pool.unlock_account(&picked.id);

        pool.mark_capacity_recovered("a", "m");
        assert!(pool.cooldown_for("a", "m").is_none());
    }

    #[tokio::test]
    async fn all_cooling_picks_earliest_expiry() {
        let pool = pool_with(&["a", "b"]);
        pool.mark_capacity_limited("a", "m", "exhausted", Some(120_000));
        pool.mark_capacity_limited("b", "m", "exhausted", Some(30_000));

        let picked = pool.get_next_account("m").await.unwrap();
        assert_eq!(picked.id, "b");
    }

    #[tokio::test]
    async fn disabled_accounts_never_selected() {
        let pool = pool_with(&["a"]);
        pool.set_account_status("a", AccountStatus::Disabled, None).await;
        assert!(pool.get_next_account("m").await.is_none());
        assert_eq!(pool.get_available_account_count(), 0);
    }

    #[tokio::test]
    async fn reset_after_hint_sets_window() {
        let pool = pool_with(&["a"]);
        pool.mark_capacity_limited("a", "m", "reset after 3s", Some(4000));
        let cd = pool.cooldown_for("a", "m").unwrap();
        let remaining = cd.cooling_until_ms - now_ms();
        assert!(remaining > 3500 && remaining <= 4000);
        assert_eq!(cd.last_reason, "reset after 3s");
    }

    #[test]
    fn gate_caps_in_flight_per_model() {
        let gate = Arc::new(ConcurrencyGate::new(2));

        let a = gate.acquire_model_slot("m").unwrap();
        let _b = gate.acquire_model_slot("m").unwrap();
        assert!(gate.acquire_model_slot("m").is_none());
        // Other models have their own counter.
        let _c = gate.acquire_model_slot("other").unwrap();

        drop(a);
        assert!(gate.acquire_model_slot("m").is_some());
    }

    #[test]
    fn gate_disabled_when_cap_zero() {
        let gate = Arc::new(ConcurrencyGate::new(0));
        let guards: Vec<_> = (0..100)
            .map(|_| gate.acquire_model_slot("m").unwrap())
            .collect();
        assert_eq!(gate.in_flight("m"), 0);
        drop(guards);
    }
}
