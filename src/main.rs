use antigravity_relay::account::Account;
use antigravity_relay::config::RelayConfig;
use antigravity_relay::dispatcher::Dispatcher;
use antigravity_relay::pool::AccountPool;
use antigravity_relay::server::{AppState, RelayServer};
use antigravity_relay::signature_cache::{SignatureCache, SignatureTtls};
use antigravity_relay::storage::Store;
use antigravity_relay::token_service::TokenService;
use antigravity_relay::upstream::{RetryEngine, RetryPolicy, UpstreamClient};
use anyhow::Context;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(RelayConfig::from_env());
    antigravity_relay::logger::init_logger(&cfg.data_dir);

    let store = Arc::new(
        Store::open(&cfg.data_dir.join("relay.db")).context("failed to open relay store")?,
    );

    let pool = Arc::new(AccountPool::new(
        Some(store.clone()),
        cfg.effective_max_concurrent_per_model(),
    ));
    let loaded = pool.load_from_store();
    tracing::info!("loaded {} accounts from store", loaded);

    if let Ok(path) = std::env::var("RELAY_ACCOUNTS_FILE") {
        match import_accounts(&pool, &path) {
            Ok(n) if n > 0 => tracing::info!("imported {} accounts from {}", n, path),
            Ok(_) => {}
            Err(e) => tracing::warn!("account import from {} failed: {}", path, e),
        }
    }

    if pool.is_empty() {
        tracing::warn!("account pool is empty; requests will fail until accounts are added");
    }

    let cache = Arc::new(SignatureCache::new(
        SignatureTtls::from_config(&cfg),
        Some(store.clone()),
    ));
    let upstream = Arc::new(UpstreamClient::new(&cfg));
    let tokens = Arc::new(TokenService::new(pool.clone(), upstream.clone(), cfg.clone()));
    tokens.spawn_schedulers();

    let engine = Arc::new(RetryEngine::new(
        pool.clone(),
        tokens.clone(),
        RetryPolicy::from_config(&cfg),
    ));

    let dispatcher = Dispatcher {
        pool,
        tokens,
        upstream,
        engine,
        cache,
        cfg: cfg.clone(),
    };

    let state = AppState {
        dispatcher,
        cfg: cfg.clone(),
    };

    let (server, handle) = RelayServer::start(state)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    server.stop();
    let _ = handle.await;

    Ok(())
}

/// Seed accounts from a JSON file: `[{"id"?, "email", "refresh_token"}]`.
fn import_accounts(pool: &AccountPool, path: &str) -> anyhow::Result<usize> {
    let content = std::fs::read_to_string(path)?;
    let seeds: Vec<serde_json::Value> = serde_json::from_str(&content)?;

    let mut imported = 0;
    for seed in seeds {
        let Some(email) = seed.get("email").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(refresh_token) = seed.get("refresh_token").and_then(|v| v.as_str()) else {
            continue;
        };
        let id = seed
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let account = Account::new(id, email.to_string(), refresh_token.to_string());
        pool.persist_account(&account);
        pool.insert_account(account);
        imported += 1;
    }
    Ok(imported)
}
