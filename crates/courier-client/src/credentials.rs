//! Relay credentials.
//!
//! Tokens are issued by the account service, which is outside this crate.
//! The transport asks the provider before every connect and every reconnect
//! attempt, so revoking a credential stops the reconnect loop.

use std::sync::{Arc, RwLock};

/// Bearer credential presented in the Hello frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Account identifier
    pub user_id: String,
    /// Bearer token
    pub token: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Source of the current credential.
pub trait CredentialProvider: Send + Sync + 'static {
    /// Current credential, `None` when signed out.
    fn credential(&self) -> Option<Credential>;
}

/// Credential held in memory and replaceable at runtime.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    current: Arc<RwLock<Option<Credential>>>,
}

impl StaticCredentials {
    /// Provider holding `credential`.
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        let credential = Credential { user_id: user_id.into(), token: token.into() };
        Self { current: Arc::new(RwLock::new(Some(credential))) }
    }

    /// Provider with no credential.
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Replace the credential.
    #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    pub fn set(&self, credential: Option<Credential>) {
        *self.current.write().expect("credential lock poisoned") = credential;
    }

    /// Drop the credential.
    pub fn clear(&self) {
        self.set(None);
    }
}

impl CredentialProvider for StaticCredentials {
    #[allow(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
    fn credential(&self) -> Option<Credential> {
        self.current.read().expect("credential lock poisoned").clone()
    }
}
