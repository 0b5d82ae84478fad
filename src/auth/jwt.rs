use std::time::Duration;

use anyhow::Context;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, warn};

use crate::{
    config::JwtConfig,
    entity::{Authenticatable, EntityId, EntityKind},
    error::AppError,
};

/// Which secret signed the token. Also embedded in the claims so a refresh
/// token can never pass as an access token.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: EntityId,
    pub email: String,
    pub role: String,
    pub kind: EntityKind,
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    pub jti: String,
    pub iss: String,
    pub iat: usize,
    pub exp: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Clone)]
struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

/// Mints and checks HS256 access/refresh tokens. Built once from config;
/// the two key pairs are read-only afterwards.
#[derive(Clone)]
pub struct TokenIssuer {
    access: KeyPair,
    refresh: KeyPair,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            access: KeyPair::from_secret(config.secret.as_bytes()),
            refresh: KeyPair::from_secret(&config.refresh_secret),
            issuer: config.issuer.clone(),
            access_ttl: config.access_ttl(),
            refresh_ttl: config.refresh_ttl(),
        }
    }

    pub fn ttl(&self, token_type: TokenType) -> Duration {
        match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        }
    }

    fn keys(&self, token_type: TokenType) -> &KeyPair {
        match token_type {
            TokenType::Access => &self.access,
            TokenType::Refresh => &self.refresh,
        }
    }

    fn claims_for(&self, entity: &dyn Authenticatable, token_type: TokenType) -> Claims {
        let now = OffsetDateTime::now_utc();
        let exp = now + TimeDuration::seconds(self.ttl(token_type).as_secs() as i64);
        Claims {
            sub: entity.id(),
            email: entity.email().to_string(),
            role: entity.role().to_string(),
            kind: entity.kind(),
            token_type,
            jti: hex::encode(crate::config::random_secret(16)),
            iss: self.issuer.clone(),
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
        }
    }

    fn sign(&self, claims: &Claims) -> anyhow::Result<String> {
        let token = encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.keys(claims.token_type).encoding,
        )
        .with_context(|| format!("sign {:?} token", claims.token_type))?;
        debug!(entity_id = %claims.sub, kind = %claims.kind, token_type = ?claims.token_type, "jwt signed");
        Ok(token)
    }

    pub fn issue_pair(&self, entity: &dyn Authenticatable) -> anyhow::Result<TokenPair> {
        Ok(TokenPair {
            access_token: self.sign(&self.claims_for(entity, TokenType::Access))?,
            refresh_token: self.sign(&self.claims_for(entity, TokenType::Refresh))?,
        })
    }

    /// Checks signature, issuer, expiry and token type against the secret
    /// for `token_type`.
    pub fn verify(&self, token: &str, token_type: TokenType) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = decode::<Claims>(token, &self.keys(token_type).decoding, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => {
                    warn!(token_type = ?token_type, "expired token");
                    AppError::ExpiredToken
                }
                other => {
                    warn!(token_type = ?token_type, reason = ?other, "invalid token");
                    AppError::InvalidToken
                }
            })?;

        if data.claims.token_type != token_type {
            warn!(expected = ?token_type, got = ?data.claims.token_type, "token type mismatch");
            return Err(AppError::InvalidToken);
        }
        debug!(entity_id = %data.claims.sub, kind = %data.claims.kind, "jwt verified");
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::random_secret, entity::User};

    fn make_issuer(issuer: &str) -> TokenIssuer {
        TokenIssuer::new(&JwtConfig {
            secret: "access-secret".into(),
            refresh_secret: random_secret(32),
            issuer: issuer.into(),
            ttl_minutes: 15,
            refresh_ttl_minutes: 60 * 24 * 7,
        })
    }

    fn user() -> User {
        User {
            id: EntityId::from_bytes([9; 12]),
            email: "a@x.com".into(),
            roles: "user".into(),
            ..Default::default()
        }
    }

    #[test]
    fn issued_pair_verifies_with_matching_secrets() {
        let issuer = make_issuer("food&friends");
        let pair = issuer.issue_pair(&user()).expect("issue");

        let access = issuer.verify(&pair.access_token, TokenType::Access).expect("access");
        assert_eq!(access.sub, user().id);
        assert_eq!(access.email, "a@x.com");
        assert_eq!(access.role, "user");
        assert_eq!(access.kind, EntityKind::User);
        assert_eq!(access.iss, "food&friends");
        assert_eq!(access.exp - access.iat, 15 * 60);

        let refresh = issuer.verify(&pair.refresh_token, TokenType::Refresh).expect("refresh");
        assert_eq!(refresh.exp - refresh.iat, 7 * 24 * 3600);
    }

    #[test]
    fn tokens_do_not_cross_secrets() {
        let issuer = make_issuer("food&friends");
        let pair = issuer.issue_pair(&user()).unwrap();
        assert!(matches!(
            issuer.verify(&pair.refresh_token, TokenType::Access),
            Err(AppError::InvalidToken)
        ));
        assert!(matches!(
            issuer.verify(&pair.access_token, TokenType::Refresh),
            Err(AppError::InvalidToken)
        ));
    }

    #[test]
    fn refresh_secret_is_per_issuer() {
        let a = make_issuer("food&friends");
        let b = make_issuer("food&friends");
        let pair = a.issue_pair(&user()).unwrap();
        // same access secret, freshly generated refresh secret
        assert!(b.verify(&pair.access_token, TokenType::Access).is_ok());
        assert!(matches!(
            b.verify(&pair.refresh_token, TokenType::Refresh),
            Err(AppError::InvalidToken)
        ));
    }

    #[test]
    fn expired_token_is_reported_as_expired() {
        let issuer = make_issuer("food&friends");
        let mut claims = issuer.claims_for(&user(), TokenType::Access);
        let now = OffsetDateTime::now_utc().unix_timestamp() as usize;
        claims.iat = now - 120;
        claims.exp = now - 1;
        let token = issuer.sign(&claims).unwrap();
        assert!(matches!(
            issuer.verify(&token, TokenType::Access),
            Err(AppError::ExpiredToken)
        ));
    }

    #[test]
    fn tampered_signature_is_invalid() {
        let issuer = make_issuer("food&friends");
        let pair = issuer.issue_pair(&user()).unwrap();
        let sig_start = pair.access_token.rfind('.').unwrap() + 1;
        let mut bytes = pair.access_token.into_bytes();
        bytes[sig_start] = if bytes[sig_start] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(matches!(
            issuer.verify(&tampered, TokenType::Access),
            Err(AppError::InvalidToken)
        ));
    }

    #[test]
    fn wrong_issuer_is_invalid() {
        let good = make_issuer("food&friends");
        let bad = make_issuer("someone-else");
        let pair = good.issue_pair(&user()).unwrap();
        assert!(matches!(
            bad.verify(&pair.access_token, TokenType::Access),
            Err(AppError::InvalidToken)
        ));
    }

    #[test]
    fn garbage_is_invalid() {
        let issuer = make_issuer("food&friends");
        assert!(matches!(
            issuer.verify("not.a.jwt", TokenType::Access),
            Err(AppError::InvalidToken)
        ));
    }

    #[test]
    fn consecutive_pairs_differ() {
        let issuer = make_issuer("food&friends");
        let a = issuer.issue_pair(&user()).unwrap();
        let b = issuer.issue_pair(&user()).unwrap();
        assert_ne!(a.refresh_token, b.refresh_token);
    }
}
