use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_ACCESS_URL_TTL_SECS: u64 = 604_800;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 1_800;
pub const DEFAULT_SIGN_CLAIM_STALE_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub access_url_base: String,
    pub access_url_secret: String,
    pub access_url_ttl_secs: u64,
    pub session_ttl_secs: u64,
    pub sign_claim_stale_secs: u64,
    pub history_limit: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = preferred_data_dir();
        Self {
            db_path: data_dir.join("signflow.sqlite3"),
            data_dir,
            access_url_base: "http://localhost:5000/files".to_string(),
            access_url_secret: random_secret(),
            access_url_ttl_secs: DEFAULT_ACCESS_URL_TTL_SECS,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            sign_claim_stale_secs: DEFAULT_SIGN_CLAIM_STALE_SECS,
            history_limit: None,
        }
    }
}

impl Config {
    /// Defaults overridden by `SIGNFLOW_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(dir) = lookup("SIGNFLOW_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            config.data_dir = PathBuf::from(dir);
            config.db_path = config.data_dir.join("signflow.sqlite3");
        }
        if let Some(path) = lookup("SIGNFLOW_DB_PATH").filter(|v| !v.trim().is_empty()) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(base) = lookup("SIGNFLOW_ACCESS_URL_BASE") {
            config.access_url_base = base.trim_end_matches('/').to_string();
        }
        if let Some(secret) = lookup("SIGNFLOW_ACCESS_URL_SECRET").filter(|v| !v.trim().is_empty()) {
            config.access_url_secret = secret;
        }
        if let Some(ttl) = parse_u64(&lookup, "SIGNFLOW_ACCESS_URL_TTL_SECS") {
            config.access_url_ttl_secs = ttl;
        }
        if let Some(ttl) = parse_u64(&lookup, "SIGNFLOW_SESSION_TTL_SECS") {
            config.session_ttl_secs = ttl;
        }
        if let Some(secs) = parse_u64(&lookup, "SIGNFLOW_SIGN_CLAIM_STALE_SECS") {
            config.sign_claim_stale_secs = secs;
        }
        if let Some(limit) = parse_u64(&lookup, "SIGNFLOW_HISTORY_LIMIT") {
            config.history_limit = usize::try_from(limit).ok().filter(|l| *l > 0);
        }
        config
    }

    pub fn access_url_ttl(&self) -> Duration {
        Duration::from_secs(self.access_url_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sign_claim_stale(&self) -> Duration {
        Duration::from_secs(self.sign_claim_stale_secs)
    }
}

fn parse_u64<F>(lookup: &F, name: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(variable = name, value = %raw, error = %e, "ignoring unparsable setting");
            None
        }
    }
}

/// Per-process signing secret. Access URLs issued with it stop verifying
/// after a restart; set `SIGNFLOW_ACCESS_URL_SECRET` to keep them valid.
fn random_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// First existing directory among the configured candidates.
pub fn preferred_data_dir() -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(custom) = std::env::var("SIGNFLOW_DATA_DIR") {
        candidates.push(PathBuf::from(custom));
    }
    if let Ok(tmpdir) = std::env::var("TMPDIR") {
        candidates.push(PathBuf::from(tmpdir));
    }
    candidates.push(std::env::temp_dir());

    for dir in candidates {
        if let Ok(meta) = std::fs::metadata(&dir) {
            if meta.is_dir() {
                return dir;
            }
        }
    }
    std::env::temp_dir()
}
