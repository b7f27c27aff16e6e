use std::{env, time::Duration};

use anyhow::{Context, Result};
use auth::{parse_duration, SignCountMode};

const DEV_SECRET: &str = "dev-secret";

#[derive(Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub step_up_ttl: Duration,
    pub rp_id: String,
    pub rp_name: String,
    pub webauthn_origins: Vec<String>,
    pub challenge_ttl: Duration,
    pub sign_count_mode: SignCountMode,
    pub transfer_min_amount_minor: i64,
    pub transfer_max_amount_minor: i64,
    pub transfer_absolute_max_minor: i64,
    pub transfer_daily_limit_minor: i64,
    pub high_value_threshold_minor: i64,
    pub default_currency: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let access_secret =
            env::var("AUTH_JWT_ACCESS_SECRET").unwrap_or_else(|_| DEV_SECRET.to_string());
        let refresh_secret =
            env::var("AUTH_JWT_REFRESH_SECRET").unwrap_or_else(|_| DEV_SECRET.to_string());

        let rp_id = env::var("WEBAUTHN_RP_ID").unwrap_or_default();
        let rp_name = env::var("WEBAUTHN_RP_NAME").unwrap_or_default();
        let webauthn_origins = split_list(&env::var("WEBAUTHN_ORIGINS").unwrap_or_default());

        if is_production_environment() {
            if access_secret == DEV_SECRET || refresh_secret == DEV_SECRET {
                anyhow::bail!(
                    "CRITICAL SECURITY ERROR: JWT secrets are using the default '{DEV_SECRET}' \
                     in production!\n\
                     This allows anyone to forge authentication tokens.\n\
                     Set AUTH_JWT_ACCESS_SECRET and AUTH_JWT_REFRESH_SECRET immediately."
                );
            }
            if rp_id.is_empty() || rp_name.is_empty() || webauthn_origins.is_empty() {
                anyhow::bail!(
                    "WEBAUTHN_RP_ID, WEBAUTHN_RP_NAME and WEBAUTHN_ORIGINS must be set in \
                     production; refusing to start without a relying party identity."
                );
            }
        }

        let rp_id = if rp_id.is_empty() {
            "localhost".to_string()
        } else {
            rp_id
        };
        let rp_name = if rp_name.is_empty() {
            "Wallet Dev".to_string()
        } else {
            rp_name
        };
        let webauthn_origins = if webauthn_origins.is_empty() {
            vec!["http://localhost:3000".to_string()]
        } else {
            webauthn_origins
        };

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid u16")?,
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set for API server")?,
            redis_url: env::var("REDIS_URL").ok(),
            access_secret,
            refresh_secret,
            access_ttl: parse_ttl("AUTH_JWT_ACCESS_TTL", 900),
            refresh_ttl: parse_ttl("AUTH_JWT_REFRESH_TTL", 604_800),
            step_up_ttl: parse_ttl("STEP_UP_TOKEN_TTL_SECONDS", 120),
            rp_id,
            rp_name,
            webauthn_origins,
            challenge_ttl: parse_millis("WEBAUTHN_CHALLENGE_TTL_MS", 60_000),
            sign_count_mode: env::var("WEBAUTHN_SIGNCOUNT_MODE")
                .ok()
                .and_then(|raw| SignCountMode::parse(&raw))
                .unwrap_or(SignCountMode::Strict),
            transfer_min_amount_minor: parse_amount("TRANSFER_MIN_AMOUNT_MINOR", 1_000),
            transfer_max_amount_minor: parse_amount("TRANSFER_MAX_AMOUNT_MINOR", 10_000_000),
            transfer_absolute_max_minor: parse_amount("TRANSFER_ABSOLUTE_MAX_MINOR", 50_000_000),
            transfer_daily_limit_minor: parse_amount("TRANSFER_DAILY_LIMIT_MINOR", 20_000_000),
            high_value_threshold_minor: parse_amount(
                "HIGH_VALUE_TRANSFER_THRESHOLD_MINOR",
                5_000_000,
            ),
            default_currency: env::var("WALLET_DEFAULT_CURRENCY")
                .unwrap_or_else(|_| "IDR".to_string()),
        })
    }
}

fn is_production_environment() -> bool {
    env::var("ENVIRONMENT")
        .or_else(|_| env::var("ENV"))
        .map(|value| {
            let lower = value.to_lowercase();
            lower == "production" || lower == "prod"
        })
        .unwrap_or(false)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|item| {
            let trimmed = item.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn parse_ttl(key: &str, default_secs: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|raw| parse_duration(&raw))
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn parse_millis(key: &str, default_ms: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_ms))
}

fn parse_amount(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_splitting_drops_blanks() {
        assert_eq!(
            split_list("https://a.example, https://b.example ,"),
            vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ]
        );
        assert!(split_list("").is_empty());
    }
}
