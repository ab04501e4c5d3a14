// OAuth refresh-token redemption. This is the hot path: interactive
// consent flows live outside the relay, accounts arrive with a refresh
// token already minted.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Redeem a refresh token for a fresh access token.
pub async fn refresh_access_token(
    http: &reqwest::Client,
    cfg: &RelayConfig,
    refresh_token: &str,
) -> RelayResult<TokenResponse> {
    let params = [
        ("client_id", cfg.oauth_client_id.as_str()),
        ("client_secret", cfg.oauth_client_secret.as_str()),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];

    let response = http
        .post(&cfg.oauth_token_url)
        .form(&params)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        return Err(RelayError::OAuth(format!(
            "token refresh failed (HTTP {}): {}",
            status, error_text
        )));
    }

    let token = response.json::<TokenResponse>().await?;
    tracing::debug!("token refresh succeeded, expires in {}s", token.expires_in);
    Ok(token)
}
