use anyhow::{bail, Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub environment: String,
    pub port: u16,
    pub database_url: String,

    // Project
    pub project_id: String,
    pub source_language: String,
    /// Allowed target languages. Empty means any language.
    pub target_languages: Vec<String>,
    /// Files refreshed by the store refresh endpoint.
    pub translation_files: Vec<String>,

    // Repository host
    pub host_api_url: String,
    pub host_api_token: Option<String>,
    pub host_ref: String,

    // Access
    pub moderator_ids: Vec<String>,
    pub api_key: Option<String>,

    // Tuning
    pub stream_chunk_size: usize,
    pub file_cache_ttl: Duration,
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let stream_chunk_size = match optional("STREAM_CHUNK_SIZE") {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("STREAM_CHUNK_SIZE must be a number, got {:?}", v))?,
            None => 200,
        };
        if stream_chunk_size == 0 {
            bail!("STREAM_CHUNK_SIZE must be greater than zero");
        }

        Ok(Self {
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://translations.db".to_string()),

            project_id: std::env::var("PROJECT_ID").context("PROJECT_ID not set")?,
            source_language: std::env::var("SOURCE_LANGUAGE").unwrap_or_else(|_| "en".to_string()),
            target_languages: optional("TARGET_LANGUAGES")
                .map(|v| list(&v))
                .unwrap_or_default(),
            translation_files: optional("TRANSLATION_FILES")
                .map(|v| list(&v))
                .unwrap_or_default(),

            host_api_url: std::env::var("HOST_API_URL")
                .context("HOST_API_URL not set")?
                .trim_end_matches('/')
                .to_string(),
            host_api_token: optional("HOST_API_TOKEN"),
            host_ref: std::env::var("HOST_REF").unwrap_or_else(|_| "main".to_string()),

            moderator_ids: optional("MODERATOR_IDS")
                .map(|v| list(&v))
                .unwrap_or_default(),
            api_key: optional("API_KEY"),

            stream_chunk_size,
            file_cache_ttl: Duration::from_secs(
                std::env::var("FILE_CACHE_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn is_moderator(&self, user_id: &str) -> bool {
        self.moderator_ids.iter().any(|m| m == user_id)
    }

    /// Whether `language` may be used as a translation target.
    pub fn allows_language(&self, language: &str) -> bool {
        language != self.source_language
            && (self.target_languages.is_empty()
                || self.target_languages.iter().any(|l| l == language))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "ENVIRONMENT",
        "PORT",
        "DATABASE_URL",
        "PROJECT_ID",
        "SOURCE_LANGUAGE",
        "TARGET_LANGUAGES",
        "TRANSLATION_FILES",
        "HOST_API_URL",
        "HOST_API_TOKEN",
        "HOST_REF",
        "MODERATOR_IDS",
        "API_KEY",
        "STREAM_CHUNK_SIZE",
        "FILE_CACHE_TTL_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    fn set_required() {
        std::env::set_var("PROJECT_ID", "docs");
        std::env::set_var("HOST_API_URL", "http://host.local/api/");
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        set_required();

        let config = Config::from_env().expect("config");
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_url, "sqlite://translations.db");
        assert_eq!(config.source_language, "en");
        assert_eq!(config.host_ref, "main");
        assert_eq!(config.host_api_url, "http://host.local/api");
        assert_eq!(config.stream_chunk_size, 200);
        assert_eq!(config.file_cache_ttl, Duration::from_secs(60));
        assert!(config.api_key.is_none());
        assert!(config.target_languages.is_empty());
        assert!(!config.is_production());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_project_id_fails() {
        clear_env();
        std::env::set_var("HOST_API_URL", "http://host.local");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("PROJECT_ID"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_lists_are_trimmed() {
        clear_env();
        set_required();
        std::env::set_var("MODERATOR_IDS", " alice, bob ,,");
        std::env::set_var("TARGET_LANGUAGES", "fr,de");
        std::env::set_var("TRANSLATION_FILES", "common.json, admin.json");

        let config = Config::from_env().expect("config");
        assert_eq!(config.moderator_ids, vec!["alice", "bob"]);
        assert_eq!(config.translation_files, vec!["common.json", "admin.json"]);
        assert!(config.is_moderator("bob"));
        assert!(!config.is_moderator("carol"));
        assert!(config.allows_language("fr"));
        assert!(!config.allows_language("es"));
        assert!(!config.allows_language("en"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_chunk_size_is_rejected() {
        clear_env();
        set_required();
        std::env::set_var("STREAM_CHUNK_SIZE", "0");
        assert!(Config::from_env().is_err());

        std::env::set_var("STREAM_CHUNK_SIZE", "lots");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_blank_api_key_is_none() {
        clear_env();
        set_required();
        std::env::set_var("API_KEY", "  ");
        assert!(Config::from_env().expect("config").api_key.is_none());
        clear_env();
    }
}
