use crate::{Error, Result};

/// Process-level configuration loaded from environment variables at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // Telegram (optional; without it events are only logged)
    pub telegram_token: Option<String>,
    pub telegram_allowed_user_ids: Vec<i64>,

    // Dashboard
    pub dashboard_token: String,
    pub dashboard_port: u16,

    // Database
    pub database_url: String,

    // Scanner settings file path
    pub scanner_config_path: String,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).filter(|v| !v.trim().is_empty()).ok_or_else(|| {
                Error::Config(format!(
                    "Required environment variable '{key}' is not set. Check your .env file."
                ))
            })
        };

        let telegram_allowed_user_ids = match lookup("TELEGRAM_ALLOWED_USER_IDS") {
            Some(raw) => parse_user_ids(&raw)?,
            None => Vec::new(),
        };

        let dashboard_port = match lookup("DASHBOARD_PORT") {
            Some(v) => v.trim().parse().map_err(|_| {
                Error::Config(format!("DASHBOARD_PORT must be a port number, got '{v}'"))
            })?,
            None => 8080,
        };

        Ok(Config {
            telegram_token: lookup("TELEGRAM_TOKEN").filter(|v| !v.trim().is_empty()),
            telegram_allowed_user_ids,
            dashboard_token: required("DASHBOARD_TOKEN")?,
            dashboard_port,
            database_url: required("DATABASE_URL")?,
            scanner_config_path: lookup("SCANNER_CONFIG_PATH")
                .unwrap_or_else(|| "config/scanner.toml".to_string()),
        })
    }
}

fn parse_user_ids(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|_| {
                Error::Config(format!(
                    "TELEGRAM_ALLOWED_USER_IDS contains non-numeric ID: '{s}'"
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn loads_required_and_defaults() {
        let cfg = Config::from_lookup(lookup(&[
            ("DASHBOARD_TOKEN", "secret"),
            ("DATABASE_URL", "sqlite://trades.db"),
        ]))
        .unwrap();
        assert_eq!(cfg.dashboard_port, 8080);
        assert!(cfg.telegram_token.is_none());
        assert!(cfg.telegram_allowed_user_ids.is_empty());
        assert_eq!(cfg.scanner_config_path, "config/scanner.toml");
    }

    #[test]
    fn missing_required_is_config_error() {
        let err = Config::from_lookup(lookup(&[("DASHBOARD_TOKEN", "secret")])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("DATABASE_URL")));
    }

    #[test]
    fn parses_user_id_list() {
        let cfg = Config::from_lookup(lookup(&[
            ("DASHBOARD_TOKEN", "secret"),
            ("DATABASE_URL", "sqlite::memory:"),
            ("TELEGRAM_TOKEN", "bot-token"),
            ("TELEGRAM_ALLOWED_USER_IDS", "1, 22 ,333"),
        ]))
        .unwrap();
        assert_eq!(cfg.telegram_allowed_user_ids, vec![1, 22, 333]);
        assert_eq!(cfg.telegram_token.as_deref(), Some("bot-token"));
    }

    #[test]
    fn rejects_non_numeric_user_id() {
        let err = Config::from_lookup(lookup(&[
            ("DASHBOARD_TOKEN", "secret"),
            ("DATABASE_URL", "sqlite::memory:"),
            ("TELEGRAM_ALLOWED_USER_IDS", "12,abc"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
