use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::sites::{KeywordFilters, Site};

/// Run configuration, loaded from a JSON file. Every field has a default so
/// a missing file means "run with defaults".
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_apply_retries: i64,
    pub max_applications_per_run: usize,
    pub driver_wait_seconds: u64,
    pub apply_cooldown_seconds: u64,
    pub title_checks: Vec<String>,
    pub negative_title_checks: Vec<String>,
    pub location_checks: Vec<String>,
    pub email_check_age_days: u32,
    pub headless: bool,
    pub session_websites: Vec<String>,
    pub find_new_jobs: bool,
    pub apply_for_jobs: bool,
    pub webdriver_url: String,
    pub imap_server: String,
    pub imap_port: u16,
    pub imap_username: String,
    pub imap_password_file: String,
    pub database_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_apply_retries: 3,
            max_applications_per_run: 1,
            driver_wait_seconds: 30,
            apply_cooldown_seconds: 3,
            title_checks: [
                "Python", "C#", "Javascript", "Backend", "Junior", "Graduate", "DevOps",
                "Software",
            ]
            .map(String::from)
            .to_vec(),
            negative_title_checks: ["C++", "Go", "Golang", "Rust", "Chinese", "Turkish"]
                .map(String::from)
                .to_vec(),
            location_checks: ["London", "Oxford", "Cambridge"].map(String::from).to_vec(),
            email_check_age_days: 5,
            headless: false,
            session_websites: Site::ALL.map(|s| s.key().to_string()).to_vec(),
            find_new_jobs: true,
            apply_for_jobs: false,
            webdriver_url: "http://localhost:4444".to_string(),
            imap_server: "imap.gmail.com".to_string(),
            imap_port: 993,
            imap_username: String::new(),
            imap_password_file: "~/.harrier.app_password.txt".to_string(),
            database_path: None,
        }
    }
}

impl Config {
    /// Load from an explicit path, or the platform config directory, or fall
    /// back to defaults when no file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "harrier")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    pub fn keyword_filters(&self) -> KeywordFilters {
        KeywordFilters {
            title_checks: self.title_checks.clone(),
            negative_title_checks: self.negative_title_checks.clone(),
            location_checks: self.location_checks.clone(),
        }
    }

    /// The sites enabled for this session, in declaration order. Unknown
    /// keys are reported and ignored.
    pub fn sites(&self) -> Vec<Site> {
        self.session_websites
            .iter()
            .filter_map(|key| {
                let site = Site::from_key(key);
                if site.is_none() {
                    warn!(key = %key, "unknown website key in session_websites");
                }
                site
            })
            .collect()
    }
}
