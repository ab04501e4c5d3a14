// SQLite-backed store: signature cache rows + account roster.
// All writes are synchronous behind a single connection lock.

use crate::account::{Account, AccountStatus, ModelQuota};
use crate::error::RelayResult;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> RelayResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> RelayResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> RelayResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS signature_cache (
                kind      TEXT NOT NULL,
                cache_key TEXT NOT NULL,
                signature TEXT NOT NULL,
                saved_at  INTEGER NOT NULL,
                PRIMARY KEY (kind, cache_key)
            );
            CREATE TABLE IF NOT EXISTS accounts (
                id               TEXT PRIMARY KEY,
                email            TEXT NOT NULL,
                refresh_token    TEXT NOT NULL,
                access_token     TEXT,
                token_expires_at INTEGER NOT NULL DEFAULT 0,
                project_id       TEXT,
                tier             TEXT,
                status           TEXT NOT NULL DEFAULT 'active',
                last_error       TEXT,
                last_used_at     INTEGER NOT NULL DEFAULT 0,
                error_count      INTEGER NOT NULL DEFAULT 0,
                quota_remaining  REAL NOT NULL DEFAULT 1.0,
                quota_reset_at   INTEGER NOT NULL DEFAULT 0,
                model_quotas     TEXT NOT NULL DEFAULT '{}'
            );",
        )?;
        Ok(())
    }

    // ===== signature_cache =====

    pub fn upsert_signature(
        &self,
        kind: &str,
        cache_key: &str,
        signature: &str,
        saved_at_ms: i64,
    ) -> RelayResult<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO signature_cache (kind, cache_key, signature, saved_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, cache_key) DO UPDATE SET
               signature = excluded.signature,
               saved_at = excluded.saved_at",
            params![kind, cache_key, signature, saved_at_ms],
        )?;
        Ok(())
    }

    pub fn get_signature(&self, kind: &str, cache_key: &str) -> RelayResult<Option<(String, i64)>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let row = conn
            .query_row(
                "SELECT signature, saved_at FROM signature_cache
                 WHERE kind = ?1 AND cache_key = ?2",
                params![kind, cache_key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Delete all rows of `kind` saved before `cutoff_ms`. Returns rows removed.
    pub fn delete_signatures_older_than(&self, kind: &str, cutoff_ms: i64) -> RelayResult<usize> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let n = conn.execute(
            "DELETE FROM signature_cache WHERE kind = ?1 AND saved_at < ?2",
            params![kind, cutoff_ms],
        )?;
        Ok(n)
    }

    // ===== accounts =====

    pub fn upsert_account(&self, account: &Account) -> RelayResult<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let quotas = serde_json::to_string(&account.model_quotas).unwrap_or_else(|_| "{}".into());
        conn.execute(
            "INSERT INTO accounts
               (id, email, refresh_token, access_token, token_expires_at, project_id, tier,
                status, last_error, last_used_at, error_count, quota_remaining, quota_reset_at,
                model_quotas)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
               email = excluded.email,
               refresh_token = excluded.refresh_token,
               access_token = excluded.access_token,
               token_expires_at = excluded.token_expires_at,
               project_id = excluded.project_id,
               tier = excluded.tier,
               status = excluded.status,
               last_error = excluded.last_error,
               last_used_at = excluded.last_used_at,
               error_count = excluded.error_count,
               quota_remaining = excluded.quota_remaining,
               quota_reset_at = excluded.quota_reset_at,
               model_quotas = excluded.model_quotas",
            params![
                account.id,
                account.email,
                account.refresh_token,
                account.access_token,
                account.token_expires_at,
                account.project_id,
                account.tier,
                account.status.as_str(),
                account.last_error,
                account.last_used_at,
                account.error_count,
                account.quota_remaining,
                account.quota_reset_at,
                quotas,
            ],
        )?;
        Ok(())
    }

    pub fn list_accounts(&self) -> RelayResult<Vec<Account>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, email, refresh_token, access_token, token_expires_at, project_id, tier,
                    status, last_error, last_used_at, error_count, quota_remaining,
                    quota_reset_at, model_quotas
             FROM accounts",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(7)?;
            let quotas_json: String = row.get(13)?;
            let model_quotas: HashMap<String, ModelQuota> =
                serde_json::from_str(&quotas_json).unwrap_or_default();
            Ok(Account {
                id: row.get(0)?,
                email: row.get(1)?,
                refresh_token: row.get(2)?,
                access_token: row.get(3)?,
                token_expires_at: row.get(4)?,
                project_id: row.get(5)?,
                tier: row.get(6)?,
                status: AccountStatus::parse(&status),
                last_error: row.get(8)?,
                last_used_at: row.get(9)?,
                error_count: row.get(10)?,
                quota_remaining: row.get(11)?,
                quota_reset_at: row.get(12)?,
                model_quotas,
            })
        })?;

        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    pub fn delete_account(&self, id: &str) -> RelayResult<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        Ok(())
    }
}
