use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn is_development(self) -> bool {
        self == AppEnv::Development
    }
}

impl FromStr for AppEnv {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(AppEnv::Development),
            "production" | "prod" => Ok(AppEnv::Production),
            other => anyhow::bail!("unknown APP_ENV {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub cookie_ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_tls: bool,
    pub from: String,
    pub timeout_secs: u64,
}

impl MailConfig {
    pub fn is_configured(&self) -> bool {
        self.smtp_host.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub env: AppEnv,
    /// Absent means the in-memory user store is used.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub public_base_url: String,
    pub jwt: JwtConfig,
    pub mail: MailConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let env = match std::env::var("APP_ENV") {
            Ok(v) => v.parse::<AppEnv>()?,
            Err(_) => AppEnv::Development,
        };
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "tourbook".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "tourbook-users".into()),
            ttl_minutes: env_or("JWT_TTL_MINUTES", 60 * 24 * 90),
            cookie_ttl_days: env_or("JWT_COOKIE_EXPIRES_IN_DAYS", 90),
        };
        let mail = MailConfig {
            smtp_host: std::env::var("EMAIL_HOST").ok().filter(|h| !h.is_empty()),
            smtp_port: env_or("EMAIL_PORT", 587),
            smtp_username: std::env::var("EMAIL_USERNAME").ok(),
            smtp_password: std::env::var("EMAIL_PASSWORD").ok(),
            smtp_tls: env_or("EMAIL_TLS", true),
            from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "tourbook <no-reply@tourbook.local>".into()),
            timeout_secs: env_or("EMAIL_TIMEOUT_SECS", 10),
        };
        Ok(Self {
            env,
            database_url: std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()),
            db_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
            db_acquire_timeout_secs: env_or("DATABASE_ACQUIRE_TIMEOUT_SECS", 5),
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into()),
            jwt,
            mail,
        })
    }

    /// Fixed configuration for tests.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            env: AppEnv::Development,
            database_url: None,
            db_max_connections: 1,
            db_acquire_timeout_secs: 1,
            public_base_url: "http://localhost:8080".into(),
            jwt: JwtConfig {
                secret: "test-secret".into(),
                issuer: "test-issuer".into(),
                audience: "test-aud".into(),
                ttl_minutes: 5,
                cookie_ttl_days: 1,
            },
            mail: MailConfig {
                smtp_host: None,
                smtp_port: 25,
                smtp_username: None,
                smtp_password: None,
                smtp_tls: false,
                from: "tourbook <no-reply@tourbook.local>".into(),
                timeout_secs: 1,
            },
        }
    }
}
