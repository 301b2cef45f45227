//! Proxy authentication with a single shared Basic credential.

use base64::{engine::general_purpose, Engine as _};
use constant_time_eq::constant_time_eq;
use http::header::{HeaderMap, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{Response, StatusCode};
use std::fmt;

use super::response::{error_response, ProxyBody};

const BASIC_PREFIX: &[u8] = b"Basic ";

/// Value of the `Proxy-Authenticate` header sent with every 407.
pub const CHALLENGE: &str = "Basic realm=\"proxy\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,
}

/// The username/password pair every client must present.
#[derive(Clone)]
pub struct ProxyCredential {
    username: String,
    password: String,
}

impl ProxyCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Check the `Proxy-Authorization` header of a request.
    pub fn check(&self, headers: &HeaderMap) -> AuthDecision {
        validate(
            headers.get(PROXY_AUTHORIZATION).map(HeaderValue::as_bytes),
            &self.username,
            &self.password,
        )
    }
}

impl fmt::Debug for ProxyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Validate a raw `Proxy-Authorization` value against the expected pair.
///
/// Anything that is not `Basic base64(user:pass)` with matching bytes is a
/// [`AuthDecision::Deny`]; there is no separate error path.
pub fn validate(raw: Option<&[u8]>, expected_user: &str, expected_pass: &str) -> AuthDecision {
    let Some((username, password)) = raw.and_then(parse_basic) else {
        return AuthDecision::Deny;
    };

    // Both halves are always compared so a mismatch takes the same path.
    let user_ok = constant_time_eq(&username, expected_user.as_bytes());
    let pass_ok = constant_time_eq(&password, expected_pass.as_bytes());

    if user_ok & pass_ok {
        AuthDecision::Allow
    } else {
        AuthDecision::Deny
    }
}

/// Split `Basic <base64>` into username and password at the first colon.
fn parse_basic(raw: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    if raw.len() < BASIC_PREFIX.len() || !raw[..BASIC_PREFIX.len()].eq_ignore_ascii_case(BASIC_PREFIX)
    {
        return None;
    }

    let mut decoded = general_purpose::STANDARD
        .decode(&raw[BASIC_PREFIX.len()..])
        .ok()?;
    let colon = decoded.iter().position(|&b| b == b':')?;
    let password = decoded.split_off(colon + 1);
    decoded.truncate(colon);

    Some((decoded, password))
}

/// 407 reply with the Basic challenge attached.
pub fn challenge() -> Response<ProxyBody> {
    let mut response = error_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, "Unauthorized");
    response
        .headers_mut()
        .insert(PROXY_AUTHENTICATE, HeaderValue::from_static(CHALLENGE));
    response
}
