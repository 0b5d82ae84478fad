use std::time::Duration;

use anyhow::Context;
use rand::RngCore;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Access-token HMAC secret.
    pub secret: String,
    /// Refresh-token HMAC secret, independent from `secret`.
    pub refresh_secret: Vec<u8>,
    pub issuer: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

impl JwtConfig {
    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs((self.ttl_minutes.max(0) as u64) * 60)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs((self.refresh_ttl_minutes.max(0) as u64) * 60)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub jwt: JwtConfig,
    pub cache_ttl_seconds: u64,
    pub request_timeout_seconds: u64,
    pub cookie_secure: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let secret = std::env::var("JWT_SECRET").context("JWT_SECRET is not set")?;
        let refresh_secret = match std::env::var("JWT_REFRESH_SECRET") {
            Ok(s) if !s.is_empty() => s.into_bytes(),
            _ => {
                warn!("JWT_REFRESH_SECRET not set; using a per-process secret, refresh tokens will not survive a restart");
                random_secret(32)
            }
        };
        if refresh_secret == secret.as_bytes() {
            anyhow::bail!("JWT_REFRESH_SECRET must differ from JWT_SECRET");
        }

        let jwt = JwtConfig {
            secret,
            refresh_secret,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "food&friends".into()),
            ttl_minutes: env_parse("JWT_ACCESS_TTL_MINUTES", 15),
            refresh_ttl_minutes: env_parse("JWT_REFRESH_TTL_MINUTES", 60 * 24 * 7),
        };

        Ok(Self {
            database_url,
            redis_url,
            jwt,
            cache_ttl_seconds: env_parse("CACHE_TTL_SECONDS", 3600),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS", 15),
            cookie_secure: env_parse("COOKIE_SECURE", true),
        })
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

pub fn random_secret(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_helpers_convert_minutes() {
        let jwt = JwtConfig {
            secret: "s".into(),
            refresh_secret: random_secret(32),
            issuer: "i".into(),
            ttl_minutes: 15,
            refresh_ttl_minutes: 60 * 24 * 7,
        };
        assert_eq!(jwt.access_ttl(), Duration::from_secs(900));
        assert_eq!(jwt.refresh_ttl(), Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn random_secrets_differ() {
        let a = random_secret(32);
        let b = random_secret(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
