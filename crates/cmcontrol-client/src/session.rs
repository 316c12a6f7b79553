use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

// Longest lifetime accepted for a token.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

struct Token {
    access: String,
    expires_at: Instant,
}

/// The `OAuth2` token obtained by the last login.
///
/// A token is valid until `margin` before its expiry, so that a request
/// never carries a token about to expire.
pub(crate) struct Session {
    margin: Duration,
    token: Mutex<Option<Token>>,
}

impl Session {
    pub(crate) const fn new(margin: Duration) -> Self {
        Self {
            margin,
            token: Mutex::new(None),
        }
    }

    fn with_token<R>(&self, f: impl FnOnce(&mut Option<Token>) -> R) -> R {
        f(&mut self.token.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn store(&self, access: String, expires_in: u64) {
        let expires_at = Instant::now() + Duration::from_secs(expires_in).min(MAX_TOKEN_LIFETIME);
        self.with_token(|token| *token = Some(Token { access, expires_at }));
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.with_token(|token| {
            token.as_ref().is_some_and(|token| {
                Instant::now()
                    .checked_add(self.margin)
                    .is_some_and(|renewal| renewal < token.expires_at)
            })
        })
    }

    /// Returns the access token, even when it needs to be renewed.
    pub(crate) fn access_token(&self) -> Option<String> {
        self.with_token(|token| token.as_ref().map(|token| token.access.clone()))
    }

    pub(crate) fn clear(&self) -> Option<String> {
        self.with_token(|token| token.take().map(|token| token.access))
    }
}
