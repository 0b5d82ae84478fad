//! Token cookies mirrored next to the JSON token response.

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use super::jwt::{TokenIssuer, TokenPair, TokenType};

pub const ACCESS_COOKIE: &str = "AccessToken";
pub const REFRESH_COOKIE: &str = "RefreshToken";

/// HttpOnly, SameSite=Strict, Path=/ cookie expiring with its token.
pub fn build_token_cookie(name: &str, value: &str, max_age: Duration, secure: bool) -> String {
    let mut cookie = format!("{name}={value}; HttpOnly");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie.push_str("; SameSite=Strict; Path=/");
    cookie.push_str(&format!("; Max-Age={}", max_age.as_secs()));
    cookie
}

pub fn token_cookie_headers(
    pair: &TokenPair,
    tokens: &TokenIssuer,
    secure: bool,
) -> anyhow::Result<[(HeaderName, HeaderValue); 2]> {
    let access = build_token_cookie(
        ACCESS_COOKIE,
        &pair.access_token,
        tokens.ttl(TokenType::Access),
        secure,
    );
    let refresh = build_token_cookie(
        REFRESH_COOKIE,
        &pair.refresh_token,
        tokens.ttl(TokenType::Refresh),
        secure,
    );
    Ok([
        (header::SET_COOKIE, HeaderValue::from_str(&access)?),
        (header::SET_COOKIE, HeaderValue::from_str(&refresh)?),
    ])
}

pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|cookie| {
            let (key, value) = cookie.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
}
