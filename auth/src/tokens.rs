use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};

pub const TOKEN_TYPE_ACCESS: &str = "access";
pub const TOKEN_TYPE_REFRESH: &str = "refresh";
pub const TOKEN_TYPE_STEP_UP: &str = "step_up";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TokenClaims {
    pub sub: String,
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(rename = "challengeId", skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<String>,
    pub iat: usize,
    pub exp: usize,
}

impl TokenClaims {
    pub fn user_id(&self) -> AuthResult<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::InvalidToken)
    }
}

#[derive(Debug, Clone)]
pub struct TokenSignerConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub step_up_ttl: Duration,
}

impl Default for TokenSignerConfig {
    fn default() -> Self {
        Self {
            access_secret: "dev-secret".to_string(),
            refresh_secret: "dev-secret".to_string(),
            access_ttl: Duration::from_secs(900),
            refresh_ttl: Duration::from_secs(604_800),
            step_up_ttl: Duration::from_secs(120),
        }
    }
}

/// Mints and verifies the three symmetric-signed token kinds. Access and
/// step-up tokens share the access secret; refresh tokens use their own.
pub struct TokenSigner {
    config: TokenSignerConfig,
}

impl TokenSigner {
    pub fn new(config: TokenSignerConfig) -> Self {
        Self { config }
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.config.refresh_ttl
    }

    fn issued_at() -> AuthResult<usize> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_secs() as usize)
            .map_err(|err| AuthError::Internal(format!("time error: {err}")))
    }

    fn sign(&self, claims: &TokenClaims, secret: &str) -> AuthResult<String> {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|err| AuthError::Internal(format!("failed to encode token: {err}")))
    }

    pub fn issue_access(&self, user_id: Uuid) -> AuthResult<String> {
        let iat = Self::issued_at()?;
        let claims = TokenClaims {
            sub: user_id.to_string(),
            r#type: TOKEN_TYPE_ACCESS.to_string(),
            jti: None,
            purpose: None,
            challenge_id: None,
            iat,
            exp: iat + self.config.access_ttl.as_secs() as usize,
        };
        self.sign(&claims, &self.config.access_secret)
    }

    pub fn issue_refresh(&self, user_id: Uuid, jti: Uuid) -> AuthResult<String> {
        let iat = Self::issued_at()?;
        let claims = TokenClaims {
            sub: user_id.to_string(),
            r#type: TOKEN_TYPE_REFRESH.to_string(),
            jti: Some(jti.to_string()),
            purpose: None,
            challenge_id: None,
            iat,
            exp: iat + self.config.refresh_ttl.as_secs() as usize,
        };
        self.sign(&claims, &self.config.refresh_secret)
    }

    pub fn issue_step_up(
        &self,
        user_id: Uuid,
        purpose: Option<String>,
        challenge_id: &str,
    ) -> AuthResult<String> {
        let iat = Self::issued_at()?;
        let claims = TokenClaims {
            sub: user_id.to_string(),
            r#type: TOKEN_TYPE_STEP_UP.to_string(),
            jti: None,
            purpose,
            challenge_id: Some(challenge_id.to_string()),
            iat,
            exp: iat + self.config.step_up_ttl.as_secs() as usize,
        };
        self.sign(&claims, &self.config.access_secret)
    }

    fn verify(&self, token: &str, secret: &str, expected_type: &str) -> AuthResult<TokenClaims> {
        let validation = Validation::new(Algorithm::HS256);
        let claims = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|_| AuthError::InvalidToken)?;

        if claims.r#type != expected_type {
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }

    pub fn verify_access(&self, token: &str) -> AuthResult<TokenClaims> {
        self.verify(token, &self.config.access_secret, TOKEN_TYPE_ACCESS)
    }

    pub fn verify_refresh(&self, token: &str) -> AuthResult<TokenClaims> {
        self.verify(token, &self.config.refresh_secret, TOKEN_TYPE_REFRESH)
    }

    pub fn verify_step_up(&self, token: &str) -> AuthResult<TokenClaims> {
        self.verify(token, &self.config.access_secret, TOKEN_TYPE_STEP_UP)
    }
}

/// Parses a TTL given as bare seconds (`"900"`) or `<N>[smhd]` (`"15m"`).
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed.parse::<u64>().ok().map(Duration::from_secs);
    }
    let (value, unit) = trimmed.split_at(trimmed.len() - 1);
    let value = value.trim().parse::<u64>().ok()?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}
