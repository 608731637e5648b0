//! Pluggable authentication for the connection handshake.
//!
//! When the server answers startup with an authentication demand, the
//! connection drives the installed [`Authenticator`] through zero or more
//! challenge rounds. Token contents are opaque to the engine; only the
//! exchange shape is modeled here.

use wireline_core::Result;

/// Outcome of evaluating a server challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeResponse {
    /// Send this token and await the server's next move.
    Token(Vec<u8>),
    /// The exchange is complete on the client side; no further token goes
    /// out. Receiving another challenge after this is a handshake failure.
    Done,
}

/// Client-side half of the authentication exchange.
pub trait Authenticator: Send {
    /// Initial token sent in response to the server's authentication demand.
    fn initial_response(&mut self) -> Vec<u8>;

    /// Evaluate a server challenge. Errors abort the handshake and render
    /// the connection defunct.
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<ChallengeResponse>;

    /// Final server token on success; most mechanisms ignore it.
    fn on_success(&mut self, _token: &[u8]) {}
}

/// Authenticator that sends one fixed token and expects no challenges.
///
/// Suitable for token-bearer style mechanisms and for tests.
#[derive(Debug, Clone)]
pub struct StaticTokenAuthenticator {
    token: Vec<u8>,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn initial_response(&mut self) -> Vec<u8> {
        self.token.clone()
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<ChallengeResponse> {
        Ok(ChallengeResponse::Done)
    }
}
