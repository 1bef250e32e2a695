//! Shared bearer token state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

/// Holder for the bearer token shared between the auth task (sole writer)
/// and the request loops (readers).
///
/// The token string swaps atomically behind an `Arc`, so a reader always
/// sees a complete value, never a mid-refresh one. An empty bearer is the
/// unauthenticated ground state.
#[derive(Debug, Default)]
pub struct TokenState {
    bearer: RwLock<Arc<String>>,
    exp_epoch_seconds: AtomicI64,
}

impl TokenState {
    /// Creates an unauthenticated token state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current bearer (empty when unauthenticated).
    #[must_use]
    pub fn bearer(&self) -> Arc<String> {
        Arc::clone(
            &self
                .bearer
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Installs a freshly issued token and its `exp` claim.
    pub fn store(&self, bearer: String, exp_epoch_seconds: i64) {
        self.exp_epoch_seconds
            .store(exp_epoch_seconds, Ordering::SeqCst);
        *self
            .bearer
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(bearer);
    }

    /// Returns to the unauthenticated ground state.
    pub fn clear(&self) {
        *self
            .bearer
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(String::new());
        self.exp_epoch_seconds.store(0, Ordering::SeqCst);
    }

    /// Seconds until the token expires, clamped at zero.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let exp = self.exp_epoch_seconds.load(Ordering::SeqCst);
        (exp - now_epoch_seconds()).max(0)
    }

    /// Returns `true` while a non-empty, unexpired token is installed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.bearer().is_empty() && self.remaining_secs() > 0
    }
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Reads the `exp` claim (Unix seconds) from a JWT without verifying it.
///
/// Verification is the issuing server's concern; the agent only needs the
/// expiry to schedule its refresh.
#[must_use]
pub(crate) fn token_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_i64()
}

#[cfg(test)]
pub(crate) fn fake_jwt(exp_epoch_seconds: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp_epoch_seconds}}}"#));
    format!("{header}.{payload}.sig")
}
