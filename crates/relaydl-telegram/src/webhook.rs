//! Webhook ingress: an axum endpoint Telegram pushes updates to.

use crate::{TelegramAdapter, TelegramUpdate};
use anyhow::{anyhow, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use relaydl_config::WebhookConfig;
use std::sync::Arc;
use tracing::{info, warn};

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
const DEFAULT_WEBHOOK_PATH: &str = "/telegram/webhook";

#[derive(Clone)]
struct WebhookState {
    adapter: Arc<TelegramAdapter>,
    secret: Option<String>,
}

pub fn webhook_path(config: &WebhookConfig) -> String {
    let path = config
        .path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty() && *p != "/")
        .unwrap_or(DEFAULT_WEBHOOK_PATH);
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn router(adapter: Arc<TelegramAdapter>, secret: Option<String>, path: &str) -> Router {
    Router::new()
        .route("/", get(|| async { "OK" }))
        .route(path, post(receive_update))
        .with_state(WebhookState { adapter, secret })
}

/// Registers the webhook with Telegram and serves it until the listener fails.
pub async fn serve_webhook(adapter: Arc<TelegramAdapter>, config: WebhookConfig) -> Result<()> {
    let path = webhook_path(&config);
    let public_url = format!("{}{}", config.public_url.trim_end_matches('/'), path);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .map_err(|e| anyhow!("cannot bind webhook listener on {}: {}", config.listen, e))?;

    if let Err(err) = adapter.sync_bot_commands().await {
        warn!("Failed to sync Telegram bot commands: {}", err);
    }
    adapter
        .set_webhook(&public_url, config.secret_token.as_deref())
        .await?;
    info!(listen = %config.listen, url = %public_url, "Telegram webhook registered");

    axum::serve(listener, router(adapter, config.secret_token.clone(), &path)).await?;
    Ok(())
}

async fn receive_update(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = &state.secret {
        let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(secret.as_str()) {
            warn!("Rejected webhook call with missing or wrong secret token");
            return StatusCode::UNAUTHORIZED;
        }
    }

    match serde_json::from_slice::<TelegramUpdate>(&body) {
        Ok(update) => {
            state.adapter.handle_update(&update);
            StatusCode::OK
        }
        Err(e) => {
            warn!("Malformed webhook update: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}
