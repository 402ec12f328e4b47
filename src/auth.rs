//! `AuthProvider`: the SASL authentication handshake's *content*, not its
//! state machine. The opcodes that drive `AUTHENTICATE`/`AUTH_CHALLENGE`/
//! `AUTH_SUCCESS` live in `net::connection`; everything a concrete
//! mechanism (PasswordAuthenticator, GSSAPI, ...) needs to supply is this
//! one trait, consumed as an external collaborator.

use std::net::SocketAddr;

use crate::error::Result;

/// Produces SASL tokens for a `Connection`'s auth handshake.
pub trait AuthProvider: Send + Sync {
    /// The token sent as the `AUTH_RESPONSE` body immediately after
    /// `AUTHENTICATE` names `authenticator_name`.
    fn initial_response(&self, endpoint: SocketAddr) -> Result<Vec<u8>>;

    /// The token sent as the next `AUTH_RESPONSE` body after an
    /// `AUTH_CHALLENGE` carrying `challenge`.
    fn evaluate_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// `PasswordAuthenticator`-compatible provider: a single initial response
/// of `\0user\0password`, no further challenges expected.
#[derive(Debug, Clone)]
pub struct PlainTextAuthProvider {
    pub username: String,
    pub password: String,
}

impl PlainTextAuthProvider {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl AuthProvider for PlainTextAuthProvider {
    fn initial_response(&self, _endpoint: SocketAddr) -> Result<Vec<u8>> {
        let mut token = Vec::with_capacity(2 + self.username.len() + self.password.len());
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        Ok(token)
    }

    fn evaluate_challenge(&self, _challenge: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}
