//! Cookie-based authentication.
//!
//! The core does not own user records; it maps opaque auth tokens to user
//! ids through the [`AuthStore`] collaborator. A token value of
//! [`POISON`] is a reserved sentinel meaning "log out": any request
//! carrying it drops the session's authenticated user.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use thiserror::Error;

/// Reserved auth-cookie value that forces a logout.
pub const POISON: &str = "poison";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth store unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Collaborator Trait
// ============================================================================

/// Token storage consulted when resolving and issuing auth cookies.
pub trait AuthStore: Send + Sync {
    /// Resolve a token to a user id. Unknown tokens are `None`, not errors.
    fn user_for_token(&self, token: &str) -> Result<Option<i64>, AuthError>;

    /// Replace any existing tokens for the user with `token`.
    fn set_token(&self, user_id: i64, token: &str) -> Result<(), AuthError>;

    /// Delete all tokens for the user.
    fn clear_user(&self, user_id: i64) -> Result<(), AuthError>;
}

/// In-memory token store, used by the demo application and tests.
#[derive(Default)]
pub struct MemoryAuthStore {
    tokens: DashMap<String, i64>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthStore for MemoryAuthStore {
    fn user_for_token(&self, token: &str) -> Result<Option<i64>, AuthError> {
        Ok(self.tokens.get(token).map(|entry| *entry.value()))
    }

    fn set_token(&self, user_id: i64, token: &str) -> Result<(), AuthError> {
        self.tokens.retain(|_, uid| *uid != user_id);
        self.tokens.insert(token.to_string(), user_id);
        Ok(())
    }

    fn clear_user(&self, user_id: i64) -> Result<(), AuthError> {
        self.tokens.retain(|_, uid| *uid != user_id);
        Ok(())
    }
}

// ============================================================================
// Pending Cookie
// ============================================================================

/// An auth cookie scheduled for the response of the current request.
#[derive(Debug, Clone)]
pub struct AuthCookie {
    pub value: String,
    /// Cookie path; defaults to the session's script path when absent.
    pub path: Option<String>,
    /// HTTP-date expiry string, already formatted.
    pub expires: Option<String>,
}

// ============================================================================
// Expiry Parsing
// ============================================================================

/// Parse a cookie expiry specification into an HTTP date.
///
/// Accepts relative offsets in the form `+1y`, `-30s`, `+12h`, with units
/// `s`, `m`, `h`, `d`, `y` (a year is 366 days). Anything else is assumed
/// to already be an RFC 2616 date and passed through unchanged.
pub fn parse_expires(expires: &str) -> String {
    if let Some(date) = parse_relative(expires) {
        return date;
    }
    expires.to_string()
}

fn parse_relative(expires: &str) -> Option<String> {
    let mut chars = expires.chars();
    let sign = match chars.next()? {
        '+' => 1,
        '-' => -1,
        _ => return None,
    };

    let rest = chars.as_str();
    // Split at the unit's char boundary; the unit may be multibyte.
    let (offset, unit) = rest.char_indices().last()?;
    let length: i64 = rest[..offset].parse().ok()?;
    if length <= 0 {
        return None;
    }

    let seconds = match unit {
        's' => length,
        'm' => length * 60,
        'h' => length * 60 * 60,
        'd' => length * 60 * 60 * 24,
        'y' => length * 60 * 60 * 24 * 366,
        _ => return None,
    };

    let when = Utc::now() + Duration::seconds(sign * seconds);
    Some(when.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryAuthStore::new();
        assert_eq!(store.user_for_token("tok").unwrap(), None);

        store.set_token(42, "tok").unwrap();
        assert_eq!(store.user_for_token("tok").unwrap(), Some(42));

        // Re-issuing invalidates the old token.
        store.set_token(42, "tok2").unwrap();
        assert_eq!(store.user_for_token("tok").unwrap(), None);
        assert_eq!(store.user_for_token("tok2").unwrap(), Some(42));

        store.clear_user(42).unwrap();
        assert_eq!(store.user_for_token("tok2").unwrap(), None);
    }

    #[test]
    fn parse_expires_relative() {
        let date = parse_expires("+1y");
        // "Sun, 01 Dec 2030 16:00:00 GMT" shape.
        assert!(date.ends_with("GMT"), "got: {date}");
        assert_eq!(date.matches(':').count(), 2);

        let past = parse_expires("-30s");
        assert!(past.ends_with("GMT"));
    }

    #[test]
    fn parse_expires_passthrough() {
        let verbatim = "Thu, 01 Dec 1994 16:00:00 GMT";
        assert_eq!(parse_expires(verbatim), verbatim);

        // Malformed relative specs fall through untouched.
        assert_eq!(parse_expires("+0y"), "+0y");
        assert_eq!(parse_expires("+5x"), "+5x");
        assert_eq!(parse_expires("soon"), "soon");
        // Multibyte unit characters must not panic the parser.
        assert_eq!(parse_expires("+1µ"), "+1µ");
        assert_eq!(parse_expires("+µ"), "+µ");
    }
}
