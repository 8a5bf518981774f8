//! Credential handed in by the auth module
//!
//! The core never logs in by itself. It receives the current credential and
//! an identity-changed signal (`watch` channel) and reacts to both.

use std::fmt;
use tokio::sync::watch;

/// Bearer credential for REST and push channel authentication
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    identity: String,
}

impl Credential {
    /// `identity` is the stable user id events get attributed to
    pub fn new(token: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            identity: identity.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("token", &"***")
            .finish()
    }
}

/// Receiving side of the auth module's identity signal. `None` = logged out.
pub type IdentitySignal = watch::Receiver<Option<Credential>>;

/// Create an identity signal seeded with `initial`
pub fn identity_channel(
    initial: Option<Credential>,
) -> (watch::Sender<Option<Credential>>, IdentitySignal) {
    watch::channel(initial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_masks_token() {
        let credential = Credential::new("secret-token", "user-1");
        let rendered = format!("{:?}", credential);
        assert!(rendered.contains("user-1"));
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn test_bearer_header_value() {
        let credential = Credential::new("abc", "user-1");
        assert_eq!(credential.bearer(), "Bearer abc");
    }
}
