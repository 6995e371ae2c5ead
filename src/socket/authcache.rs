//! Authentication cache for proxy and server credentials.
//!
//! Based on Chromium's HttpAuthCache. Entries are keyed by origin (or proxy)
//! and realm; the most recently stored entry per origin is also offered for
//! preemptive use so later requests skip the 401/407 round trip.

use crate::base::neterror::NetError;
use crate::http::auth::{AuthChallenge, AuthScheme, Credentials, DigestAuthHandler};
use dashmap::DashMap;
use http::HeaderValue;
use std::sync::{Arc, Mutex};

/// Whether credentials answer a server or a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthTarget {
    Server,
    Proxy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OriginKey {
    host: String,
    port: u16,
    target: AuthTarget,
}

impl OriginKey {
    fn new(host: &str, port: u16, target: AuthTarget) -> Self {
        Self { host: host.to_ascii_lowercase(), port, target }
    }
}

/// Cached credentials for one realm, plus the scheme state needed to
/// answer it again.
#[derive(Debug)]
pub struct AuthEntry {
    scheme: AuthScheme,
    realm: String,
    credentials: Credentials,
    digest: Option<Mutex<DigestAuthHandler>>,
}

impl AuthEntry {
    pub fn new(
        scheme: AuthScheme,
        challenge: &AuthChallenge,
        credentials: Credentials,
    ) -> Result<Self, NetError> {
        let digest = match scheme {
            AuthScheme::Basic => None,
            AuthScheme::Digest => Some(Mutex::new(DigestAuthHandler::from_challenge(challenge)?)),
        };
        Ok(Self { scheme, realm: challenge.realm().to_string(), credentials, digest })
    }

    pub fn basic(realm: impl Into<String>, credentials: Credentials) -> Self {
        Self { scheme: AuthScheme::Basic, realm: realm.into(), credentials, digest: None }
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Header value answering a request for `method` on request-target `uri`.
    pub fn authorization(&self, method: &str, uri: &str) -> Result<HeaderValue, NetError> {
        let token = match &self.digest {
            None => self.credentials.basic_header(),
            Some(handler) => {
                let mut handler = handler.lock().map_err(|_| NetError::InvalidAuthCredentials)?;
                zeroize::Zeroizing::new(handler.generate_auth_token(method, uri, &self.credentials)?)
            }
        };
        let mut value =
            HeaderValue::from_str(&token).map_err(|_| NetError::InvalidAuthCredentials)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Thread-safe authentication cache.
#[derive(Debug, Clone, Default)]
pub struct AuthCache {
    entries: Arc<DashMap<(OriginKey, String), Arc<AuthEntry>>>,
    latest: Arc<DashMap<OriginKey, String>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials for a specific realm.
    pub fn lookup(
        &self,
        host: &str,
        port: u16,
        realm: &str,
        target: AuthTarget,
    ) -> Option<Arc<AuthEntry>> {
        let key = (OriginKey::new(host, port, target), realm.to_string());
        self.entries.get(&key).map(|e| Arc::clone(&e))
    }

    /// The most recently stored entry for an origin, for preemptive use.
    pub fn preemptive(&self, host: &str, port: u16, target: AuthTarget) -> Option<Arc<AuthEntry>> {
        let origin = OriginKey::new(host, port, target);
        let realm = self.latest.get(&origin).map(|r| r.clone())?;
        self.entries.get(&(origin, realm)).map(|e| Arc::clone(&e))
    }

    pub fn store(&self, host: &str, port: u16, target: AuthTarget, entry: AuthEntry) -> Arc<AuthEntry> {
        let origin = OriginKey::new(host, port, target);
        let entry = Arc::new(entry);
        self.latest.insert(origin.clone(), entry.realm.clone());
        self.entries.insert((origin, entry.realm.clone()), Arc::clone(&entry));
        entry
    }

    /// Drop credentials the peer rejected.
    pub fn evict(&self, host: &str, port: u16, realm: &str, target: AuthTarget) {
        let origin = OriginKey::new(host, port, target);
        self.entries.remove(&(origin.clone(), realm.to_string()));
        self.latest.remove_if(&origin, |_, r| r == realm);
    }

    /// Remove credentials for a host (all realms, both targets).
    pub fn remove_host(&self, host: &str, port: u16) {
        let host = host.to_ascii_lowercase();
        self.entries.retain(|(o, _), _| !(o.host == host && o.port == port));
        self.latest.retain(|o, _| !(o.host == host && o.port == port));
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.latest.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::auth::parse_challenges;

    fn basic(realm: &str, user: &str) -> AuthEntry {
        AuthEntry::basic(realm, Credentials::new(user, "pass"))
    }

    #[test]
    fn test_store_and_lookup() {
        let cache = AuthCache::new();
        cache.store("proxy.example.com", 8080, AuthTarget::Proxy, basic("MyRealm", "user"));

        let found = cache.lookup("proxy.example.com", 8080, "MyRealm", AuthTarget::Proxy).unwrap();
        assert_eq!(found.credentials().username(), "user");
        assert!(cache.lookup("proxy.example.com", 8080, "MyRealm", AuthTarget::Server).is_none());
    }

    #[test]
    fn test_different_realms_and_preemptive() {
        let cache = AuthCache::new();
        cache.store("a.com", 80, AuthTarget::Server, basic("Realm1", "user1"));
        cache.store("a.com", 80, AuthTarget::Server, basic("Realm2", "user2"));

        assert_eq!(
            cache.lookup("a.com", 80, "Realm1", AuthTarget::Server).unwrap().credentials().username(),
            "user1"
        );
        let latest = cache.preemptive("A.COM", 80, AuthTarget::Server).unwrap();
        assert_eq!(latest.realm(), "Realm2");
    }

    #[test]
    fn test_evict() {
        let cache = AuthCache::new();
        cache.store("a.com", 80, AuthTarget::Server, basic("R", "u"));
        cache.evict("a.com", 80, "R", AuthTarget::Server);
        assert!(cache.is_empty());
        assert!(cache.preemptive("a.com", 80, AuthTarget::Server).is_none());
    }

    #[test]
    fn test_remove_host() {
        let cache = AuthCache::new();
        cache.store("proxy.com", 80, AuthTarget::Proxy, basic("Realm1", "u"));
        cache.store("proxy.com", 80, AuthTarget::Server, basic("Realm2", "u"));
        cache.store("other.com", 80, AuthTarget::Server, basic("Realm1", "u"));

        cache.remove_host("Proxy.com", 80);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("other.com", 80, "Realm1", AuthTarget::Server).is_some());
    }

    #[test]
    fn test_authorization_values() {
        let entry = basic("R", "user");
        let value = entry.authorization("GET", "/").unwrap();
        assert_eq!(value.to_str().unwrap(), "Basic dXNlcjpwYXNz");
        assert!(value.is_sensitive());

        let challenge = &parse_challenges(r#"Digest realm="R", nonce="n", qop="auth""#)[0];
        let digest =
            AuthEntry::new(AuthScheme::Digest, challenge, Credentials::new("u", "p")).unwrap();
        let first = digest.authorization("GET", "/a").unwrap();
        let second = digest.authorization("GET", "/a").unwrap();
        assert!(first.to_str().unwrap().contains("nc=00000001"));
        assert!(second.to_str().unwrap().contains("nc=00000002"));
    }
}
