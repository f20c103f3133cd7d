//! The narrow interface to the external identity service.
//!
//! The sync engine never issues or refreshes sessions; it consumes an
//! authenticated `(account_id, device_id)` pair from whatever identity
//! layer fronts it and trusts the account id it is handed.

/// An authenticated account-device pair for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthedSession {
    pub account_id: String,
    pub device_id: String,
}

/// Verifies connection credentials supplied by the identity layer.
pub trait SessionVerifier: Send + Sync {
    /// Returns the authenticated session, or None to reject the connection.
    fn verify(
        &self,
        account_id: &str,
        device_id: &str,
        token: Option<&str>,
    ) -> Option<AuthedSession>;
}

/// Static-token verifier for deployments behind a trusted gateway.
///
/// With a configured token, connections must present it; without one the
/// gateway is assumed to have authenticated the account already.
pub struct StaticTokenVerifier {
    shared_token: Option<String>,
}

impl StaticTokenVerifier {
    pub fn new(shared_token: Option<String>) -> Self {
        Self { shared_token }
    }
}

impl SessionVerifier for StaticTokenVerifier {
    fn verify(
        &self,
        account_id: &str,
        device_id: &str,
        token: Option<&str>,
    ) -> Option<AuthedSession> {
        if account_id.is_empty() || device_id.is_empty() {
            return None;
        }
        match &self.shared_token {
            Some(expected) if token != Some(expected.as_str()) => None,
            _ => Some(AuthedSession {
                account_id: account_id.to_string(),
                device_id: device_id.to_string(),
            }),
        }
    }
}
