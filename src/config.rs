use crate::store::{DEFAULT_BATCH_LIMIT, MAX_BATCH_LIMIT};
use std::path::PathBuf;

pub const LOG_ENV: &str = "IBADAHD_LOG";
pub const WORKSPACE_ENV: &str = "IBADAHD_WORKSPACE";
pub const BATCH_LIMIT_ENV: &str = "IBADAHD_BATCH_LIMIT";
pub const SEED_ROSTER_ENV: &str = "IBADAHD_SEED_ROSTER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log_filter: String,
    pub workspace: Option<PathBuf>,
    pub batch_limit: usize,
    pub seed_roster: bool,
    /// Problems found while reading the environment, logged once tracing is up.
    pub warnings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            workspace: None,
            batch_limit: DEFAULT_BATCH_LIMIT,
            seed_roster: true,
            warnings: Vec::new(),
        }
    }
}

impl Config {
    /// Reads the process environment, after loading a `.env` file if present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let mut warnings = Vec::new();
        let non_blank = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let batch_limit = match non_blank(BATCH_LIMIT_ENV) {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if (1..=MAX_BATCH_LIMIT).contains(&n) => n,
                _ => {
                    warnings.push(format!(
                        "ignoring {}={:?}; expected 1..={}",
                        BATCH_LIMIT_ENV, raw, MAX_BATCH_LIMIT
                    ));
                    defaults.batch_limit
                }
            },
            None => defaults.batch_limit,
        };
        let seed_roster = match non_blank(SEED_ROSTER_ENV).map(|v| v.to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            _ => defaults.seed_roster,
        };

        Self {
            log_filter: non_blank(LOG_ENV).unwrap_or(defaults.log_filter),
            workspace: non_blank(WORKSPACE_ENV).map(PathBuf::from),
            batch_limit,
            seed_roster,
            warnings,
        }
    }
}
