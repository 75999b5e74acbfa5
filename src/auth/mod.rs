//! API-key authentication.
//!
//! Keys are presented via `Authorization: Bearer <key>`, a bare
//! `Authorization` header, or `X-API-Key`, carry a stable `jen_` prefix
//! that distinguishes them from session tokens, and are stored only as
//! SHA-256 hashes. Verification checks activity, expiry, the IP
//! allowlist, and route scopes, then attaches a principal to the
//! request. Usage records are emitted asynchronously so accounting
//! never sits on the request path.

pub mod rate_limit;

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::Store;
use crate::types::{ApiKeyRecord, ApiKeyRole, JenguError, UsageRecord};

/// SHA-256 hex digest of a presented key.
pub fn hash_key(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Pull the presented credential out of the request headers.
/// `X-API-Key` wins, then `Authorization` with or without `Bearer`.
pub fn extract_presented_key(
    authorization: Option<&str>,
    x_api_key: Option<&str>,
) -> Option<String> {
    if let Some(key) = x_api_key {
        let key = key.trim();
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    let auth = authorization?.trim();
    if auth.is_empty() {
        return None;
    }
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// The authenticated principal attached to a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub key_id: String,
    pub user_id: String,
    pub role: ApiKeyRole,
    pub scopes: Vec<String>,
    pub quota_per_minute: u32,
    pub quota_per_hour: u32,
    pub quota_per_day: u32,
}

impl AuthContext {
    fn from_record(record: &ApiKeyRecord) -> Self {
        Self {
            key_id: record.key_id.clone(),
            user_id: record.user_id.clone(),
            role: record.role,
            scopes: record.scopes.clone(),
            quota_per_minute: record.quota_per_minute,
            quota_per_hour: record.quota_per_hour,
            quota_per_day: record.quota_per_day,
        }
    }
}

// ---------------------------------------------------------------------------
// Session seam
// ---------------------------------------------------------------------------

/// Tokens without the API-key prefix are session tokens; verifying them
/// belongs to the external session layer behind this seam.
#[async_trait::async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthContext, JenguError>;
}

/// Deployment without a session layer: session tokens are rejected.
pub struct NoSessionAuth;

#[async_trait::async_trait]
impl SessionVerifier for NoSessionAuth {
    async fn verify(&self, _token: &str) -> Result<AuthContext, JenguError> {
        Err(JenguError::Authentication(
            "session tokens are not accepted on this surface".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

/// Hash-based key verification with scope and IP checks.
pub struct Authenticator {
    store: Arc<dyn Store>,
    key_prefix: String,
    sessions: Arc<dyn SessionVerifier>,
    usage_tx: mpsc::UnboundedSender<UsageRecord>,
}

impl Authenticator {
    /// Build the authenticator and spawn its usage-record writer.
    pub fn new(
        store: Arc<dyn Store>,
        key_prefix: &str,
        sessions: Arc<dyn SessionVerifier>,
    ) -> (Self, JoinHandle<()>) {
        let (usage_tx, usage_rx) = mpsc::unbounded_channel();
        let writer = spawn_usage_writer(store.clone(), usage_rx);
        (
            Self {
                store,
                key_prefix: key_prefix.to_string(),
                sessions,
                usage_tx,
            },
            writer,
        )
    }

    /// Verify a presented credential against the caller's IP and the
    /// route's required scope.
    pub async fn authenticate(
        &self,
        presented: &str,
        ip: &str,
        required_scope: Option<&str>,
    ) -> Result<AuthContext, JenguError> {
        // Flexible path: anything without the key prefix is a session
        // token and goes to the session layer.
        if !presented.starts_with(&self.key_prefix) {
            return self.sessions.verify(presented).await;
        }

        let record = self
            .store
            .api_key_by_hash(&hash_key(presented))
            .await?
            .ok_or_else(|| JenguError::Authentication("invalid_api_key".to_string()))?;

        if !record.is_usable(chrono::Utc::now()) {
            debug!(key_id = %record.key_id, "Key inactive or expired");
            return Err(JenguError::Authentication("invalid_api_key".to_string()));
        }
        if !record.ip_allowed(ip) {
            debug!(key_id = %record.key_id, ip, "IP not in allowlist");
            return Err(JenguError::Authorization("ip_not_allowed".to_string()));
        }
        if let Some(scope) = required_scope {
            if !record.has_scope(scope) {
                debug!(key_id = %record.key_id, scope, "Scope missing");
                return Err(JenguError::Authorization("insufficient_scope".to_string()));
            }
        }

        Ok(AuthContext::from_record(&record))
    }

    /// Queue a usage record for asynchronous persistence. Never blocks,
    /// never fails the request.
    pub fn record_usage(&self, record: UsageRecord) {
        if self.usage_tx.send(record).is_err() {
            warn!("Usage writer is gone, dropping usage record");
        }
    }
}

/// Drain usage records into the store until the channel closes.
fn spawn_usage_writer(
    store: Arc<dyn Store>,
    mut rx: mpsc::UnboundedReceiver<UsageRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let Err(e) = store.record_usage(&record).await {
                warn!(error = %e, "Failed to persist usage record");
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
