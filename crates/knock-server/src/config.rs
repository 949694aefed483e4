use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Attempts per relationship write before reporting unavailable.
    pub store_attempts: u32,
}

impl Config {
    /// Read configuration from the process environment (after `.env`).
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = get("KNOCK_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("KNOCK_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let port = match get("KNOCK_PORT") {
            Some(raw) => raw.parse().with_context(|| format!("invalid KNOCK_PORT '{}'", raw))?,
            None => 3000,
        };

        let store_attempts = match get("KNOCK_STORE_ATTEMPTS") {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .with_context(|| format!("invalid KNOCK_STORE_ATTEMPTS '{}'", raw))?,
            None => 3,
        };

        Ok(Self {
            jwt_secret,
            db_path: get("KNOCK_DB_PATH").unwrap_or_else(|| "knock.db".into()).into(),
            host: get("KNOCK_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            store_attempts,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[("KNOCK_JWT_SECRET", "s3cret-value")])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.db_path, PathBuf::from("knock.db"));
        assert_eq!(config.store_attempts, 3);
        assert_eq!(config.addr().unwrap().port(), 3000);
    }

    #[test]
    fn placeholder_secret_is_rejected() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(Config::from_lookup(lookup(&[("KNOCK_JWT_SECRET", "dev-secret-change-me")])).is_err());
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let secret = ("KNOCK_JWT_SECRET", "s3cret-value");
        assert!(Config::from_lookup(lookup(&[secret, ("KNOCK_PORT", "http")])).is_err());
        assert!(Config::from_lookup(lookup(&[secret, ("KNOCK_STORE_ATTEMPTS", "0")])).is_err());

        let config = Config::from_lookup(lookup(&[secret, ("KNOCK_STORE_ATTEMPTS", "5")])).unwrap();
        assert_eq!(config.store_attempts, 5);
    }
}
