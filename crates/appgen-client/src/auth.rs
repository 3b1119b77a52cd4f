//! Auth token lookup seam.
//!
//! Token acquisition, refresh, and storage live outside this crate; the
//! client only asks "what token should go on this request right now".

use std::sync::Arc;

/// Synchronous token lookup consulted on every outgoing request.
///
/// Returning `None` is not an error — the request goes out without an
/// `Authorization` header and the server decides.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Fixed token, useful for tests and server-to-server callers.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self(token.into()))
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Always-unauthenticated provider.
pub struct NoToken;

impl TokenProvider for NoToken {
    fn token(&self) -> Option<String> {
        None
    }
}
