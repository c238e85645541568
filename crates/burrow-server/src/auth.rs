//! Client authentication and subdomain ownership capabilities.
//!
//! The control plane only ever talks to these traits; the no-op,
//! static-map and (externally provided) database-backed variants are
//! interchangeable. A database-backed implementation would typically wrap
//! a static one as its fallback.

use crate::config::AuthConfig;
use async_trait::async_trait;
use burrow_core::{Result, TunnelError};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::info;

/// Validates client tokens.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Whether the token is valid.
    async fn validate(&self, token: &str) -> Result<bool>;

    /// The user id associated with a token.
    async fn user_id(&self, token: &str) -> Result<String>;
}

/// Maps subdomains to owning identities (e.g. from the dashboard
/// database). `None` means first-come-first-served.
#[async_trait]
pub trait OwnerChecker: Send + Sync {
    async fn subdomain_owner(&self, subdomain: &str) -> Result<Option<String>>;
}

/// Accepts every token. For development and tests.
pub struct NoOpAuthenticator;

#[async_trait]
impl Authenticator for NoOpAuthenticator {
    async fn validate(&self, _token: &str) -> Result<bool> {
        Ok(true)
    }

    async fn user_id(&self, token: &str) -> Result<String> {
        Ok(token.to_string())
    }
}

/// Validates tokens against a static list.
pub struct TokenAuthenticator {
    tokens: RwLock<HashMap<String, String>>,
}

impl TokenAuthenticator {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_token(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.write().await.insert(token.into(), user_id.into());
    }

    pub async fn remove_token(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    pub async fn token_count(&self) -> usize {
        self.tokens.read().await.len()
    }

    /// Load tokens from a file: one `token` or `token:user_id` per line,
    /// `#` starts a comment.
    pub async fn load_from_file(&self, path: &str) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await?;

        let mut tokens = self.tokens.write().await;
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (token, user_id) = match line.split_once(':') {
                Some((t, u)) => (t.trim(), u.trim()),
                None => (line, line),
            };
            if token.is_empty() {
                return Err(TunnelError::Internal(format!(
                    "invalid token on line {}",
                    line_num + 1
                )));
            }
            tokens.insert(token.to_string(), user_id.to_string());
        }

        info!(count = tokens.len(), "loaded tokens");
        Ok(())
    }
}

impl Default for TokenAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn validate(&self, token: &str) -> Result<bool> {
        let tokens = self.tokens.read().await;

        // Fold over the whole list so the comparison cost does not depend
        // on which (if any) entry matches.
        let mut found = subtle::Choice::from(0u8);
        for stored in tokens.keys() {
            found |= stored.as_bytes().ct_eq(token.as_bytes());
        }
        Ok(found.into())
    }

    async fn user_id(&self, token: &str) -> Result<String> {
        let tokens = self.tokens.read().await;

        let mut user_id = None;
        for (stored, uid) in tokens.iter() {
            if bool::from(stored.as_bytes().ct_eq(token.as_bytes())) {
                user_id = Some(uid.clone());
            }
        }
        user_id.ok_or(TunnelError::Unauthorized)
    }
}

/// Owner checker over a fixed map. The database-backed variant lives with
/// the dashboard; it satisfies the same trait.
pub struct StaticOwnerChecker {
    owners: HashMap<String, String>,
}

impl StaticOwnerChecker {
    pub fn new(owners: HashMap<String, String>) -> Self {
        Self { owners }
    }
}

#[async_trait]
impl OwnerChecker for StaticOwnerChecker {
    async fn subdomain_owner(&self, subdomain: &str) -> Result<Option<String>> {
        Ok(self.owners.get(subdomain).cloned())
    }
}

/// Build an authenticator from the `[auth]` config section.
pub async fn from_config(cfg: &AuthConfig) -> Result<Arc<dyn Authenticator>> {
    match cfg.mode.as_str() {
        "none" => Ok(Arc::new(NoOpAuthenticator)),
        "token" => {
            let auth = TokenAuthenticator::new();
            if !cfg.token_file.is_empty() {
                auth.load_from_file(&cfg.token_file).await?;
            }
            Ok(Arc::new(auth))
        }
        "jwt" => Err(TunnelError::Internal(
            "JWT authentication not yet implemented".into(),
        )),
        other => Err(TunnelError::Internal(format!("unknown auth mode: {other}"))),
    }
}
