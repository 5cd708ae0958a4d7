use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShelfError};

/// Root application configuration, loaded from `~/.config/shelfmark/config.toml`
/// and then overridden from `SHELFMARK_*` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub core: CoreConfig,
    pub catalogs: CatalogsConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
    pub recommendations: RecommendationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub library_path: String,
}

/// Upstream catalog endpoints and transport limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogsConfig {
    pub open_library_url: String,
    pub covers_url: String,
    pub google_books_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_books_api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    /// Pause between sequential upstream calls during bulk refresh.
    pub batch_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub book_ttl_days: i64,
    pub max_categories: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Result count at which the search stops consulting further sources.
    pub min_results: usize,
    pub default_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationConfig {
    pub ttl_days: i64,
    pub activity_threshold: u32,
    pub min_refresh_interval_days: i64,
    pub min_signal_events: usize,
    pub high_rating_floor: u8,
    pub max_recommendations: usize,
}

// ─── Defaults ──────────────────────────────────────────────

impl Default for CoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("shelfmark");
        Self {
            library_path: data_dir.to_string_lossy().to_string(),
        }
    }
}

impl Default for CatalogsConfig {
    fn default() -> Self {
        Self {
            open_library_url: "https://openlibrary.org".to_string(),
            covers_url: "https://covers.openlibrary.org".to_string(),
            google_books_url: "https://www.googleapis.com/books/v1".to_string(),
            google_books_api_key: None,
            request_timeout_secs: 10,
            max_retries: 2,
            batch_delay_ms: 250,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            book_ttl_days: 30,
            max_categories: 5,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_results: 5,
            default_limit: 20,
        }
    }
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            ttl_days: 5,
            activity_threshold: 3,
            min_refresh_interval_days: 7,
            min_signal_events: 3,
            high_rating_floor: 4,
            max_recommendations: 5,
        }
    }
}

// ─── Load / Save ───────────────────────────────────────────

impl AppConfig {
    /// Standard config file path: `~/.config/shelfmark/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("SHELFMARK_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("shelfmark")
            .join("config.toml")
    }

    /// Load config from disk and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load config from a specific path, falling back to defaults if it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// Apply `SHELFMARK_*` overrides. `lookup` resolves a variable name to its value.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SHELFMARK_LIBRARY_PATH") {
            self.core.library_path = v;
        }
        if let Some(v) = lookup("SHELFMARK_OPEN_LIBRARY_URL") {
            self.catalogs.open_library_url = v;
        }
        if let Some(v) = lookup("SHELFMARK_COVERS_URL") {
            self.catalogs.covers_url = v;
        }
        if let Some(v) = lookup("SHELFMARK_GOOGLE_BOOKS_URL") {
            self.catalogs.google_books_url = v;
        }
        if let Some(v) = lookup("SHELFMARK_GOOGLE_BOOKS_API_KEY") {
            self.catalogs.google_books_api_key = Some(v).filter(|k| !k.trim().is_empty());
        }

        override_parsed(&lookup, "SHELFMARK_REQUEST_TIMEOUT_SECS", &mut self.catalogs.request_timeout_secs)?;
        override_parsed(&lookup, "SHELFMARK_BATCH_DELAY_MS", &mut self.catalogs.batch_delay_ms)?;
        override_parsed(&lookup, "SHELFMARK_BOOK_TTL_DAYS", &mut self.cache.book_ttl_days)?;
        override_parsed(&lookup, "SHELFMARK_MIN_RESULTS", &mut self.search.min_results)?;
        override_parsed(&lookup, "SHELFMARK_RECS_TTL_DAYS", &mut self.recommendations.ttl_days)?;
        override_parsed(
            &lookup,
            "SHELFMARK_RECS_ACTIVITY_THRESHOLD",
            &mut self.recommendations.activity_threshold,
        )?;
        override_parsed(
            &lookup,
            "SHELFMARK_RECS_MIN_REFRESH_DAYS",
            &mut self.recommendations.min_refresh_interval_days,
        )?;
        Ok(())
    }

    // ─── Derived paths ─────────────────────────────────────

    pub fn library_path(&self) -> PathBuf {
        PathBuf::from(&self.core.library_path)
    }

    /// Path to the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.library_path().join("db").join("shelfmark.db")
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ShelfError::ConfigError(format!("{name}: cannot parse {raw:?}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_match_documented_policy() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.cache.book_ttl_days, 30);
        assert_eq!(cfg.cache.max_categories, 5);
        assert_eq!(cfg.search.min_results, 5);
        assert_eq!(cfg.recommendations.ttl_days, 5);
        assert_eq!(cfg.recommendations.activity_threshold, 3);
        assert_eq!(cfg.recommendations.min_refresh_interval_days, 7);
        assert!(cfg.catalogs.google_books_api_key.is_none());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut cfg = AppConfig::default();
        cfg.search.min_results = 8;
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.search.min_results, 8);
        assert_eq!(loaded.catalogs.open_library_url, cfg.catalogs.open_library_url);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nbook_ttl_days = 14\n").unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.cache.book_ttl_days, 14);
        assert_eq!(loaded.cache.max_categories, 5);
        assert_eq!(loaded.search.min_results, 5);
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let cfg = AppConfig::load_from(Path::new("/tmp/nonexistent_shelfmark_config.toml")).unwrap();
        assert_eq!(cfg.cache.book_ttl_days, 30);
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(env(&[
            ("SHELFMARK_BOOK_TTL_DAYS", "10"),
            ("SHELFMARK_GOOGLE_BOOKS_API_KEY", "secret"),
            ("SHELFMARK_RECS_ACTIVITY_THRESHOLD", "6"),
            ("SHELFMARK_OPEN_LIBRARY_URL", "http://localhost:9000"),
        ]))
        .unwrap();

        assert_eq!(cfg.cache.book_ttl_days, 10);
        assert_eq!(cfg.catalogs.google_books_api_key.as_deref(), Some("secret"));
        assert_eq!(cfg.recommendations.activity_threshold, 6);
        assert_eq!(cfg.catalogs.open_library_url, "http://localhost:9000");
    }

    #[test]
    fn test_blank_api_key_is_ignored() {
        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(env(&[("SHELFMARK_GOOGLE_BOOKS_API_KEY", "  ")]))
            .unwrap();
        assert!(cfg.catalogs.google_books_api_key.is_none());
    }

    #[test]
    fn test_unparseable_env_value_is_config_error() {
        let mut cfg = AppConfig::default();
        let err = cfg
            .apply_env_overrides(env(&[("SHELFMARK_MIN_RESULTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ShelfError::ConfigError(msg) if msg.contains("SHELFMARK_MIN_RESULTS")));
    }

    #[test]
    fn test_derived_paths() {
        let cfg = AppConfig::default();
        let db = cfg.database_path();
        assert!(db.to_string_lossy().ends_with("shelfmark.db"));
    }
}
