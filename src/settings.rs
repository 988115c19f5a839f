use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_BASE_URL: &str = "https://hiring.idenhq.com/";
pub const DEFAULT_CONFIG_FILE: &str = "catalog_scraper.toml";
const ENV_PREFIX: &str = "CATALOG";

/// Runtime settings. Layered: defaults < TOML file < `CATALOG_*` env < CLI flags.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    pub headless: bool,
    pub batch_size: usize,
    pub max_products: usize,
    pub stall_threshold: u32,
    pub settle_delay_ms: u64,
    pub output_dir: PathBuf,
    pub session_file: PathBuf,
    pub reuse_session: bool,
    pub log_file: Option<PathBuf>,
    pub email: Option<String>,
    pub password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            base_url: DEFAULT_BASE_URL.to_string(),
            headless: true,
            batch_size: 2000,
            max_products: 50_000,
            stall_threshold: 3,
            settle_delay_ms: 800,
            output_dir: PathBuf::from("."),
            session_file: PathBuf::from("session_state.json"),
            reuse_session: true,
            log_file: Some(PathBuf::from("catalog_scraper.log")),
            email: None,
            password: None,
        }
    }
}

// Hand-written so the password never ends up in a log line.
impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("base_url", &self.base_url)
            .field("headless", &self.headless)
            .field("batch_size", &self.batch_size)
            .field("max_products", &self.max_products)
            .field("stall_threshold", &self.stall_threshold)
            .field("settle_delay_ms", &self.settle_delay_ms)
            .field("output_dir", &self.output_dir)
            .field("session_file", &self.session_file)
            .field("reuse_session", &self.reuse_session)
            .field("log_file", &self.log_file)
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Settings {
    /// Load settings from an optional TOML file and the environment.
    ///
    /// An explicit `path` must exist; the default file is optional. Not
    /// validated here: CLI flags still apply on top, then `validate` runs.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let mut settings: Settings = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;

        settings.normalize();
        Ok(settings)
    }

    pub fn normalize(&mut self) {
        let trimmed = self.base_url.trim_end_matches('/').len();
        self.base_url.truncate(trimmed);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.stall_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "stall_threshold",
                reason: "must be at least 1".into(),
            });
        }
        if self.base_url.is_empty() {
            return Err(ConfigError::Invalid {
                key: "base_url",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Join a path onto the base URL, e.g. `url("challenge")`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Tests that read or write `CATALOG_*` variables hold this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(k, _)| (k.to_string(), env::var(k).ok()))
            .collect();
        for (k, v) in vars {
            env::set_var(k, v);
        }
        let out = f();
        for (k, old) in saved {
            match old {
                Some(v) => env::set_var(&k, v),
                None => env::remove_var(&k),
            }
        }
        out
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.batch_size, 2000);
        assert_eq!(s.max_products, 50_000);
        assert_eq!(s.stall_threshold, 3);
        assert_eq!(s.settle_delay(), Duration::from_millis(800));
        assert!(s.headless);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let mut s = Settings::default();
        s.normalize();
        assert_eq!(s.base_url, "https://hiring.idenhq.com");
        assert_eq!(s.url("/challenge"), "https://hiring.idenhq.com/challenge");
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let s = Settings {
            batch_size: 0,
            ..Settings::default()
        };
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Invalid { key: "batch_size", .. })
        ));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scraper.toml");
        std::fs::write(&path, "batch_size = 250\nheadless = false\n").unwrap();

        let s = with_env(&[], || Settings::load(Some(&path))).unwrap();
        assert_eq!(s.batch_size, 250);
        assert!(!s.headless);
        assert_eq!(s.max_products, 50_000);
    }

    #[test]
    fn env_overrides_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scraper.toml");
        std::fs::write(&path, "batch_size = 250\nheadless = false\n").unwrap();

        let s = with_env(
            &[
                ("CATALOG_BATCH_SIZE", "500"),
                ("CATALOG_HEADLESS", "true"),
                ("CATALOG_PASSWORD", "007"),
            ],
            || Settings::load(Some(&path)),
        )
        .unwrap();
        assert_eq!(s.batch_size, 500);
        assert!(s.headless);
        assert_eq!(s.password.as_deref(), Some("007"));
    }

    #[test]
    fn zero_batch_size_in_file_can_be_overridden_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scraper.toml");
        std::fs::write(&path, "batch_size = 0\n").unwrap();

        let mut s = with_env(&[], || Settings::load(Some(&path))).unwrap();
        assert!(s.validate().is_err());
        s.batch_size = 100;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn debug_hides_password() {
        let s = Settings {
            password: Some("hunter2".into()),
            ..Settings::default()
        };
        assert!(!format!("{:?}", s).contains("hunter2"));
    }
}
