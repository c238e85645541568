//! The subdomain ↔ session index.
//!
//! Lookups take the read half of one RwLock; registration and removal
//! take the write half. A subdomain maps to exactly one session at a
//! time.

use crate::auth::OwnerChecker;
use crate::session::Session;
use burrow_core::{Result, TunnelConfig, TunnelError, TunnelStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A registered tunnel.
#[derive(Clone)]
pub struct TunnelEntry {
    pub subdomain: String,
    pub local_port: u16,
    pub local_host: String,
    pub protocol: String,
    pub session: Arc<Session>,
}

#[derive(Default)]
struct RegistryInner {
    /// subdomain → tunnel entry.
    tunnels: HashMap<String, TunnelEntry>,
    /// session id → session.
    sessions: HashMap<String, Arc<Session>>,
}

/// Maps public host identities to the sessions that service them.
pub struct Registry {
    inner: RwLock<RegistryInner>,
    reserved: HashSet<String>,
    domain: String,
    owner_checker: RwLock<Option<Arc<dyn OwnerChecker>>>,
}

/// The admission predicate: 3-63 characters, lowercase alphanumeric plus
/// hyphens, starting with a letter (`^[a-z][a-z0-9-]{2,62}$`).
fn is_valid_subdomain(s: &str) -> bool {
    let bytes = s.as_bytes();
    if !(3..=63).contains(&bytes.len()) {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

impl Registry {
    /// Create a registry for the given base domain.
    pub fn new(domain: impl Into<String>, reserved_subdomains: &[String]) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            reserved: reserved_subdomains.iter().map(|s| s.to_lowercase()).collect(),
            domain: domain.into(),
            owner_checker: RwLock::new(None),
        }
    }

    /// Install an owner checker consulted during registration.
    pub async fn set_owner_checker(&self, checker: Arc<dyn OwnerChecker>) {
        *self.owner_checker.write().await = Some(checker);
    }

    /// The base domain public URLs are built from.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Check a subdomain is admissible (after lowercasing).
    pub fn validate_subdomain(&self, subdomain: &str) -> Result<()> {
        let subdomain = subdomain.to_lowercase();

        if !is_valid_subdomain(&subdomain) {
            return Err(TunnelError::SubdomainInvalid(
                "must be 3-63 lowercase alphanumeric characters starting with a letter".into(),
            ));
        }
        if self.reserved.contains(&subdomain) {
            return Err(TunnelError::SubdomainReserved(subdomain));
        }
        Ok(())
    }

    /// Register tunnels for a session, returning one status per requested
    /// tunnel in request order. The session is inserted into the index
    /// even if some (or all) tunnels fail; callers discard it when
    /// nothing registered.
    pub async fn register(
        &self,
        session: &Arc<Session>,
        tunnels: &[TunnelConfig],
    ) -> Vec<TunnelStatus> {
        // Owner lookups go to an external collaborator; resolve them
        // before taking the write lock.
        let checker = self.owner_checker.read().await.clone();
        let mut owners: Vec<Option<String>> = Vec::with_capacity(tunnels.len());
        for tc in tunnels {
            let subdomain = tc.subdomain.to_lowercase();
            let owner = match &checker {
                Some(c) => c.subdomain_owner(&subdomain).await.ok().flatten(),
                None => None,
            };
            owners.push(owner);
        }

        let mut inner = self.inner.write().await;
        let mut results = Vec::with_capacity(tunnels.len());

        for (tc, owner) in tunnels.iter().zip(owners) {
            let subdomain = tc.subdomain.to_lowercase();
            let mut status = TunnelStatus {
                subdomain: subdomain.clone(),
                local_port: tc.local_port,
                url: String::new(),
                status: String::new(),
                error: String::new(),
            };

            if let Err(e) = self.validate_subdomain(&subdomain) {
                status.status = "error".into();
                status.error = e.to_string();
                results.push(status);
                continue;
            }

            // A subdomain reserved to another identity in the database
            // cannot be claimed, even if currently unused.
            if let Some(owner) = owner {
                if owner != session.token {
                    status.status = "error".into();
                    status.error = TunnelError::SubdomainReserved(subdomain.clone()).to_string();
                    results.push(status);
                    continue;
                }
            }

            if let Some(existing) = inner.tunnels.get(&subdomain) {
                if existing.session.id != session.id {
                    status.status = "error".into();
                    status.error = TunnelError::SubdomainTaken.to_string();
                    results.push(status);
                    continue;
                }
                // Same session re-registering is idempotent.
            }

            inner.tunnels.insert(
                subdomain.clone(),
                TunnelEntry {
                    subdomain: subdomain.clone(),
                    local_port: tc.local_port,
                    local_host: tc.local_host.clone(),
                    protocol: tc.protocol.clone(),
                    session: session.clone(),
                },
            );

            status.status = "active".into();
            status.url = self.build_url(&subdomain);
            debug!(subdomain = %subdomain, session_id = %session.id, "tunnel registered");
            results.push(status);
        }

        inner.sessions.insert(session.id.clone(), session.clone());
        results
    }

    /// Remove a session and every tunnel it owns.
    pub async fn unregister(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        inner.tunnels.retain(|_, entry| entry.session.id != session_id);
        if inner.sessions.remove(session_id).is_some() {
            info!(session_id = %session_id, "session unregistered");
        }
    }

    /// Remove one tunnel, verifying the caller owns it.
    pub async fn unregister_tunnel(&self, session_id: &str, subdomain: &str) -> Result<()> {
        let subdomain = subdomain.to_lowercase();
        let mut inner = self.inner.write().await;

        let entry = inner
            .tunnels
            .get(&subdomain)
            .ok_or_else(|| TunnelError::TunnelNotFound(subdomain.clone()))?;
        if entry.session.id != session_id {
            return Err(TunnelError::Unauthorized);
        }

        inner.tunnels.remove(&subdomain);
        debug!(subdomain = %subdomain, session_id = %session_id, "tunnel unregistered");
        Ok(())
    }

    /// Case-insensitive direct lookup.
    pub async fn lookup(&self, subdomain: &str) -> Option<TunnelEntry> {
        let inner = self.inner.read().await;
        inner.tunnels.get(&subdomain.to_lowercase()).cloned()
    }

    /// Extract the subdomain from a Host header and look it up.
    pub async fn lookup_by_host(&self, host: &str) -> Option<TunnelEntry> {
        let host = host.split(':').next().unwrap_or(host).to_lowercase();
        let suffix = format!(".{}", self.domain);
        let subdomain = host.strip_suffix(&suffix)?;
        self.lookup(subdomain).await
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.sessions.get(session_id).cloned()
    }

    pub async fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    pub async fn tunnel_count(&self) -> usize {
        self.inner.read().await.tunnels.len()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// All tunnels owned by one session.
    pub async fn tunnels_for_session(&self, session_id: &str) -> Vec<TunnelEntry> {
        let inner = self.inner.read().await;
        inner
            .tunnels
            .values()
            .filter(|e| e.session.id == session_id)
            .cloned()
            .collect()
    }

    fn build_url(&self, subdomain: &str) -> String {
        // TLS termination lives at the edge; public URLs advertise http.
        format!("http://{}.{}", subdomain, self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::mux::{Mode, MuxConfig, MuxSession};

    fn test_session(token: &str) -> Arc<Session> {
        // The mux state is irrelevant to registry behaviour; the peer half
        // is simply dropped.
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let mux = MuxSession::new(a, Mode::Server, MuxConfig::default());
        Session::new(mux, token, "test-client", "127.0.0.1:9999")
    }

    fn tc(subdomain: &str, port: u16) -> TunnelConfig {
        TunnelConfig {
            subdomain: subdomain.into(),
            local_port: port,
            local_host: "127.0.0.1".into(),
            protocol: "http".into(),
        }
    }

    #[test]
    fn subdomain_admission_boundaries() {
        assert!(!is_valid_subdomain("ab")); // length 2
        assert!(is_valid_subdomain("abc")); // length 3
        assert!(is_valid_subdomain(&"a".repeat(63)));
        assert!(!is_valid_subdomain(&"a".repeat(64)));
        assert!(!is_valid_subdomain("1abc")); // must start with a letter
        assert!(!is_valid_subdomain("Abc")); // uppercase rejected here
        assert!(!is_valid_subdomain("ab_c"));
        assert!(is_valid_subdomain("my-app-2"));
    }

    #[tokio::test]
    async fn validates_reserved_and_invalid() {
        let registry = Registry::new("example.test", &["admin".to_string()]);
        assert!(matches!(
            registry.validate_subdomain("admin"),
            Err(TunnelError::SubdomainReserved(_))
        ));
        assert!(matches!(
            registry.validate_subdomain("Admin"),
            Err(TunnelError::SubdomainReserved(_))
        ));
        assert!(matches!(
            registry.validate_subdomain("x"),
            Err(TunnelError::SubdomainInvalid(_))
        ));
        registry.validate_subdomain("MyApp").unwrap(); // normalised first
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = Registry::new("example.test", &[]);
        let session = test_session("tok-a");

        let statuses = registry
            .register(&session, &[tc("api", 3000), tc("web", 8080)])
            .await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.is_active()));
        assert_eq!(statuses[0].url, "http://api.example.test");

        assert!(registry.lookup("api").await.is_some());
        assert!(registry.lookup("API").await.is_some());
        assert!(registry.lookup_by_host("api.example.test").await.is_some());
        assert!(registry
            .lookup_by_host("API.EXAMPLE.TEST:8080")
            .await
            .is_some());
        assert!(registry.lookup_by_host("api.other.test").await.is_none());
        assert!(registry.lookup_by_host("example.test").await.is_none());
        assert_eq!(registry.tunnel_count().await, 2);
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn collision_is_per_tunnel_and_positional() {
        let registry = Registry::new("example.test", &[]);
        let session_a = test_session("tok-a");
        let session_b = test_session("tok-b");

        let first = registry.register(&session_a, &[tc("web", 3000)]).await;
        assert!(first[0].is_active());

        let second = registry
            .register(&session_b, &[tc("web", 4000), tc("docs", 4001)])
            .await;
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].subdomain, "web");
        assert_eq!(second[0].status, "error");
        assert!(second[0].error.contains("taken"));
        assert!(second[1].is_active());
        assert_eq!(second[1].url, "http://docs.example.test");

        // The original owner keeps the mapping.
        let entry = registry.lookup("web").await.unwrap();
        assert_eq!(entry.session.id, session_a.id);
    }

    #[tokio::test]
    async fn re_registration_by_same_session_is_idempotent() {
        let registry = Registry::new("example.test", &[]);
        let session = test_session("tok-a");

        registry.register(&session, &[tc("app", 3000)]).await;
        let again = registry.register(&session, &[tc("app", 3001)]).await;
        assert!(again[0].is_active());
        assert_eq!(registry.lookup("app").await.unwrap().local_port, 3001);
    }

    #[tokio::test]
    async fn owner_checker_vetoes_foreign_subdomains() {
        let registry = Registry::new("example.test", &[]);
        let mut owners = HashMap::new();
        owners.insert("shop".to_string(), "tok-owner".to_string());
        registry
            .set_owner_checker(Arc::new(crate::auth::StaticOwnerChecker::new(owners)))
            .await;

        let intruder = test_session("tok-intruder");
        let statuses = registry.register(&intruder, &[tc("shop", 3000)]).await;
        assert_eq!(statuses[0].status, "error");
        assert!(statuses[0].error.contains("reserved"));

        let owner = test_session("tok-owner");
        let statuses = registry.register(&owner, &[tc("shop", 3000)]).await;
        assert!(statuses[0].is_active());
    }

    #[tokio::test]
    async fn unregister_variants() {
        let registry = Registry::new("example.test", &[]);
        let session_a = test_session("tok-a");
        let session_b = test_session("tok-b");

        registry
            .register(&session_a, &[tc("one", 1001), tc("two", 1002)])
            .await;
        registry.register(&session_b, &[tc("three", 1003)]).await;

        assert!(matches!(
            registry.unregister_tunnel(&session_b.id, "one").await,
            Err(TunnelError::Unauthorized)
        ));
        assert!(matches!(
            registry.unregister_tunnel(&session_a.id, "ghost").await,
            Err(TunnelError::TunnelNotFound(_))
        ));
        registry.unregister_tunnel(&session_a.id, "one").await.unwrap();
        assert!(registry.lookup("one").await.is_none());

        registry.unregister(&session_a.id).await;
        assert!(registry.lookup("two").await.is_none());
        assert!(registry.lookup("three").await.is_some());
        assert_eq!(registry.session_count().await, 1);
    }
}
