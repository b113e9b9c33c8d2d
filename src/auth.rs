use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Result, bail};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::config::{ClpPaths, FileSignature, file_signature, read_json_file};

pub const TOKEN_PREFIX: &str = "clp_";
const TOKEN_LENGTH: usize = 32;

/// Paths that never require a token.
const WHITELIST: &[&str] = &["/health", "/ping", "/favicon.ico"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Services this token may call; empty means all.
    #[serde(default)]
    pub services: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Global gate; off by default so existing setups keep working.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
    /// Per-service gates, keyed ui / claude / codex; missing keys mean on.
    #[serde(default)]
    pub services: HashMap<String, bool>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let mut services = HashMap::new();
        services.insert("ui".to_string(), true);
        services.insert("claude".to_string(), true);
        services.insert("codex".to_string(), true);
        Self {
            enabled: false,
            tokens: Vec::new(),
            services,
        }
    }
}

struct AuthState {
    config: Arc<AuthConfig>,
    signature: FileSignature,
    loaded: bool,
}

/// Token gate in front of the engine. `auth.json` is hot-reloaded by file
/// signature; verification is pure lookup so the request path stays cheap.
pub struct AuthManager {
    path: PathBuf,
    state: RwLock<AuthState>,
}

impl AuthManager {
    pub fn new(paths: &ClpPaths) -> Self {
        Self {
            path: paths.auth_config(),
            state: RwLock::new(AuthState {
                config: Arc::new(AuthConfig::default()),
                signature: FileSignature(0, 0),
                loaded: false,
            }),
        }
    }

    pub fn config(&self) -> Arc<AuthConfig> {
        let sig = file_signature(&self.path);
        {
            let state = self.state.read().expect("auth lock");
            if state.loaded && state.signature == sig {
                return state.config.clone();
            }
        }
        let config: Arc<AuthConfig> =
            Arc::new(read_json_file(&self.path).unwrap_or_default());
        let mut state = self.state.write().expect("auth lock");
        state.config = config.clone();
        state.signature = sig;
        state.loaded = true;
        config
    }

    pub fn is_enabled(&self, service: &str) -> bool {
        let config = self.config();
        if !config.enabled {
            return false;
        }
        config.services.get(service).copied().unwrap_or(true)
    }

    pub fn verify(&self, token: &str, service: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let config = self.config();
        for entry in &config.tokens {
            if entry.token != token || !entry.active {
                continue;
            }
            if let Some(expires_at) = entry.expires_at.as_deref()
                && let Ok(expiry) = chrono::DateTime::parse_from_rfc3339(expires_at)
                && chrono::Utc::now() > expiry
            {
                continue;
            }
            if !entry.services.is_empty()
                && !entry.services.iter().any(|s| s == service)
            {
                continue;
            }
            return true;
        }
        false
    }

    fn write(&self, config: &AuthConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        let mut state = self.state.write().expect("auth lock");
        state.config = Arc::new(config.clone());
        state.signature = file_signature(&self.path);
        state.loaded = true;
        Ok(())
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        let mut config = (*self.config()).clone();
        config.enabled = enabled;
        self.write(&config)
    }

    pub fn add_token(
        &self,
        name: &str,
        description: &str,
        expires_at: Option<String>,
        services: Vec<String>,
    ) -> Result<String> {
        let mut config = (*self.config()).clone();
        if config.tokens.iter().any(|t| t.name == name) {
            bail!("token '{name}' already exists");
        }
        let token = generate_token();
        config.tokens.push(TokenEntry {
            token: token.clone(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            expires_at,
            active: true,
            services,
        });
        self.write(&config)?;
        Ok(token)
    }

    pub fn remove_token(&self, name: &str) -> Result<()> {
        let mut config = (*self.config()).clone();
        let before = config.tokens.len();
        config.tokens.retain(|t| t.name != name);
        if config.tokens.len() == before {
            bail!("token '{name}' does not exist");
        }
        self.write(&config)
    }

    pub fn list_tokens(&self) -> Vec<TokenEntry> {
        self.config().tokens.clone()
    }
}

/// `clp_` plus 32 Base62 characters.
pub fn generate_token() -> String {
    let body: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect();
    format!("{TOKEN_PREFIX}{body}")
}

pub fn validate_token_format(token: &str) -> bool {
    let Some(body) = token.strip_prefix(TOKEN_PREFIX) else {
        return false;
    };
    body.len() >= TOKEN_LENGTH && body.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Pull a proxy token from a request. Only `clp_`-prefixed values count so
/// upstream credentials pass through to the engine untouched.
/// Precedence: Authorization Bearer, then X-API-Key, then `?token=`.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok())
        && let Some(bearer) = auth.strip_prefix("Bearer ")
    {
        let bearer = bearer.trim();
        if bearer.starts_with(TOKEN_PREFIX) {
            return Some(bearer.to_string());
        }
    }
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok())
        && key.starts_with(TOKEN_PREFIX)
    {
        return Some(key.to_string());
    }
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((k, v)) = pair.split_once('=')
                && k == "token"
                && v.starts_with(TOKEN_PREFIX)
            {
                return Some(v.to_string());
            }
        }
    }
    None
}

#[derive(Clone)]
pub struct AuthLayerState {
    pub auth: Arc<AuthManager>,
    pub service: &'static str,
}

/// axum middleware: 401 unless the gate is disabled, the path is
/// whitelisted, or the request carries a valid token.
pub async fn require_token(
    State(state): State<AuthLayerState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.auth.is_enabled(state.service) {
        return next.run(request).await;
    }
    let path = request.uri().path();
    if WHITELIST.contains(&path) {
        return next.run(request).await;
    }

    let token = extract_token(request.headers(), request.uri().query());
    let ok = token
        .as_deref()
        .map(|t| validate_token_format(t) && state.auth.verify(t, state.service))
        .unwrap_or(false);
    if !ok {
        let body = serde_json::json!({
            "error": "Unauthorized",
            "message": "invalid or expired proxy token",
        });
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(body),
        )
            .into_response();
    }
    next.run(request).await
}

/// Health probes bypass authentication entirely.
pub async fn health() -> (StatusCode, axum::Json<serde_json::Value>) {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({"status": "ok"})),
    )
}
