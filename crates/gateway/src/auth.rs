//! Password hashing and bearer-token helpers shared by the HTTP and
//! WebSocket entry points.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::HeaderMap;
use axum_extra::extract::cookie::CookieJar;

use watchroom_common::Error;

pub const TOKEN_COOKIE_NAME: &str = "token";

/// Constant-time string comparison; tokens are bearer secrets compared
/// server-side, so a naive `==` would leak timing information.
pub fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

pub fn hash_password(password: &str) -> watchroom_common::Result<String> {
    // `password-hash` pins its own `rand_core`; reuse its re-export rather
    // than the workspace `rand` crate's `OsRng`, whose major version may
    // not line up.
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::internal(anyhow::anyhow!("password hash: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Extracts the bearer token from either the `Authorization` header or the
/// `token` cookie — clients may use either path.
pub fn extract_token(headers: &HeaderMap, jar: &CookieJar) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = auth.to_str() {
            if let Some(stripped) = s.strip_prefix("Bearer ") {
                return Some(stripped.to_string());
            }
        }
    }
    jar.get(TOKEN_COOKIE_NAME).map(|c| c.value().to_string())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use axum_extra::extract::cookie::Cookie;

    use super::*;

    #[test]
    fn safe_equal_matches_identical_strings() {
        assert!(safe_equal("abc123", "abc123"));
    }

    #[test]
    fn safe_equal_rejects_different_length() {
        assert!(!safe_equal("short", "muchlonger"));
    }

    #[test]
    fn safe_equal_rejects_same_length_mismatch() {
        assert!(!safe_equal("abc123", "abc124"));
    }

    #[test]
    fn hash_then_verify_round_trips() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn hash_password_salts_differently_each_call() {
        let a = hash_password("same input").unwrap();
        let b = hash_password("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn verify_password_rejects_malformed_hash() {
        assert!(!verify_password("whatever", "not-a-phc-hash"));
    }

    #[test]
    fn extract_token_prefers_authorization_header_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer header-token".parse().unwrap(),
        );
        let jar = CookieJar::default().add(Cookie::new(TOKEN_COOKIE_NAME, "cookie-token"));
        assert_eq!(extract_token(&headers, &jar).as_deref(), Some("header-token"));
    }

    #[test]
    fn extract_token_falls_back_to_cookie() {
        let headers = HeaderMap::new();
        let jar = CookieJar::default().add(Cookie::new(TOKEN_COOKIE_NAME, "cookie-token"));
        assert_eq!(extract_token(&headers, &jar).as_deref(), Some("cookie-token"));
    }

    #[test]
    fn extract_token_ignores_non_bearer_header_without_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Basic xyz".parse().unwrap());
        let jar = CookieJar::default();
        assert_eq!(extract_token(&headers, &jar), None);
    }

    #[test]
    fn extract_token_returns_none_when_absent() {
        let headers = HeaderMap::new();
        let jar = CookieJar::default();
        assert_eq!(extract_token(&headers, &jar), None);
    }
}
