use crate::protocol::{AuthMethod, SUBNEGOTIATION_VERSION, UserPassRequest};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

/// UserPass implementation block
impl UserPass {
    /// new is a constructor for the UserPass type
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Keep the password out of logs
impl fmt::Debug for UserPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPass")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// AuthStrategy decides whether a sub-negotiation payload is acceptable.
///
/// `payload` is the raw sub-negotiation frame as read from the client and
/// `config` is whatever was registered alongside the strategy. Strategies are
/// shared by every connection and must not keep per-call state.
pub trait AuthStrategy: Send + Sync {
    /// authorize returns true when the client may proceed
    fn authorize(&self, payload: &[u8], config: Option<&UserPass>) -> bool;
}

/// Closures work as strategies
impl<F> AuthStrategy for F
where
    F: Fn(&[u8], Option<&UserPass>) -> bool + Send + Sync,
{
    fn authorize(&self, payload: &[u8], config: Option<&UserPass>) -> bool {
        self(payload, config)
    }
}

/// NoAuth accepts everyone
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl AuthStrategy for NoAuth {
    fn authorize(&self, _payload: &[u8], _config: Option<&UserPass>) -> bool {
        true
    }
}

/// UsernamePassword is the RFC 1929 check against the registered credentials.
///
/// The comparison is a plain string equality, not a constant-time one.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsernamePassword;

impl AuthStrategy for UsernamePassword {
    fn authorize(&self, payload: &[u8], config: Option<&UserPass>) -> bool {
        // No registered credentials means nobody gets in
        let Some(expected) = config else {
            return false;
        };

        // Anything we cannot decode fails closed
        let Ok(request) = UserPassRequest::decode(payload) else {
            return false;
        };

        // Check version number, then compare credentials
        request.version == SUBNEGOTIATION_VERSION
            && request.username == expected.username
            && request.password == expected.password
    }
}

/// RegistryError is a registration the registry refuses
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no built-in strategy for method {0:#04x}, one must be supplied")]
    NoDefaultStrategy(u8),

    #[error("method {0:#04x} is reserved for 'no acceptable methods'")]
    Reserved(u8),
}

/// AuthEntry is one registered method: its configuration and strategy
#[derive(Clone)]
pub struct AuthEntry {
    pub config: Option<UserPass>,
    pub strategy: Arc<dyn AuthStrategy>,
}

/// AuthEntry implementation block
impl AuthEntry {
    /// authorize runs the strategy with the registered config
    pub fn authorize(&self, payload: &[u8]) -> bool {
        self.strategy.authorize(payload, self.config.as_ref())
    }
}

impl fmt::Debug for AuthEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthEntry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// AuthRegistry maps method ids to the strategy that authorizes them.
///
/// It is filled before the server starts accepting and shared read-only by
/// every connection afterwards.
#[derive(Debug, Clone, Default)]
pub struct AuthRegistry {
    methods: HashMap<u8, AuthEntry>,
}

/// AuthRegistry implementation block
impl AuthRegistry {
    /// new is a constructor for an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// register adds or replaces the entry for `method`. Without a strategy
    /// the built-in one for that method is used.
    pub fn register(
        &mut self,
        method: u8,
        config: Option<UserPass>,
        strategy: Option<Arc<dyn AuthStrategy>>,
    ) -> Result<(), RegistryError> {
        // 0xFF is the refusal sentinel
        if method == AuthMethod::NoAcceptable as u8 {
            return Err(RegistryError::Reserved(method));
        }

        let strategy = match strategy {
            Some(strategy) => strategy,
            None => default_strategy(method).ok_or(RegistryError::NoDefaultStrategy(method))?,
        };

        // Last registration wins
        self.methods.insert(method, AuthEntry { config, strategy });
        Ok(())
    }

    /// resolve looks up the entry registered for `method`
    pub fn resolve(&self, method: u8) -> Option<&AuthEntry> {
        self.methods.get(&method)
    }

    /// select returns the first offered method that is registered, in the
    /// order the client offered them
    pub fn select(&self, offered: &[u8]) -> Option<u8> {
        offered
            .iter()
            .copied()
            .find(|method| self.methods.contains_key(method))
    }

    /// is_empty is true when no method is registered
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// default_strategy is the built-in strategy for a method, if any
fn default_strategy(method: u8) -> Option<Arc<dyn AuthStrategy>> {
    match AuthMethod::from_byte(method)? {
        AuthMethod::NoAuth => Some(Arc::new(NoAuth)),
        AuthMethod::UserPass => Some(Arc::new(UsernamePassword)),
        AuthMethod::NoAcceptable => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn userpass_registry() -> AuthRegistry {
        let mut registry = AuthRegistry::new();
        registry
            .register(
                AuthMethod::UserPass as u8,
                Some(UserPass::new("u", "p")),
                None,
            )
            .unwrap();
        registry
    }

    #[test]
    fn userpass_accepts_matching_credentials() {
        let registry = userpass_registry();
        let entry = registry.resolve(0x02).unwrap();
        assert!(entry.authorize(&UserPassRequest::new("u", "p").encode()));
        assert!(!entry.authorize(&UserPassRequest::new("u", "wrong").encode()));
    }

    #[test]
    fn userpass_fails_closed_on_bad_version() {
        let registry = userpass_registry();
        let mut payload = UserPassRequest::new("u", "p").encode();
        payload[0] = 0x05;
        assert!(!registry.resolve(0x02).unwrap().authorize(&payload));
        assert!(!registry.resolve(0x02).unwrap().authorize(&[0x01, 9]));
    }

    #[test]
    fn userpass_without_config_rejects() {
        let mut registry = AuthRegistry::new();
        registry.register(0x02, None, None).unwrap();
        let payload = UserPassRequest::new("", "").encode();
        assert!(!registry.resolve(0x02).unwrap().authorize(&payload));
    }

    #[test]
    fn select_follows_offer_order() {
        let mut registry = userpass_registry();
        registry.register(0x00, None, None).unwrap();
        assert_eq!(registry.select(&[0x02, 0x00]), Some(0x02));
        assert_eq!(registry.select(&[0x00, 0x02]), Some(0x00));
        assert_eq!(registry.select(&[0x01, 0x80]), None);
        assert_eq!(registry.select(&[]), None);
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = userpass_registry();
        registry
            .register(0x02, Some(UserPass::new("other", "secret")), None)
            .unwrap();
        let entry = registry.resolve(0x02).unwrap();
        assert!(!entry.authorize(&UserPassRequest::new("u", "p").encode()));
        assert!(entry.authorize(&UserPassRequest::new("other", "secret").encode()));
    }

    #[test]
    fn custom_strategy_for_private_method() {
        let mut registry = AuthRegistry::new();
        assert_eq!(
            registry.register(0x80, None, None),
            Err(RegistryError::NoDefaultStrategy(0x80))
        );

        let token: Arc<dyn AuthStrategy> =
            Arc::new(|payload: &[u8], _: Option<&UserPass>| payload.ends_with(b"token"));
        registry.register(0x80, None, Some(token)).unwrap();
        assert!(registry.resolve(0x80).unwrap().authorize(b"\x01token"));
        assert!(!registry.resolve(0x80).unwrap().authorize(b"\x01nope"));
    }

    #[test]
    fn sentinel_cannot_be_registered() {
        let mut registry = AuthRegistry::new();
        assert_eq!(
            registry.register(0xFF, None, Some(Arc::new(NoAuth))),
            Err(RegistryError::Reserved(0xFF))
        );
        assert!(registry.is_empty());
    }
}
