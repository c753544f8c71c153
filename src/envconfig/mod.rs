use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::DEFAULT_PORT;
use crate::server::ConnectionOptions;
use crate::session::TurnLimits;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CHECKPOINTS_DIR: &str = "./checkpoints";
pub const DEFAULT_MAX_TOKENS: usize = 1024;
pub const DEFAULT_MAX_SECONDS: u64 = 300;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_NGRAM_ORDER: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    pub host: String,
    pub port: u16,
    pub checkpoints_dir: PathBuf,
    pub max_tokens: usize,
    pub max_time: Duration,
    pub max_frame_bytes: usize,
    pub keep_alive: bool,
    pub seed: u64,
    /// Training text for the n-gram backend; the bundled corpus when unset.
    pub corpus: Option<PathBuf>,
    pub ngram_order: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            checkpoints_dir: PathBuf::from(DEFAULT_CHECKPOINTS_DIR),
            max_tokens: DEFAULT_MAX_TOKENS,
            max_time: Duration::from_secs(DEFAULT_MAX_SECONDS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            keep_alive: false,
            seed: DEFAULT_SEED,
            corpus: None,
            ngram_order: DEFAULT_NGRAM_ORDER,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for the
    /// `SSMPROV_*` keys. Unparsable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("SSMPROV_HOST") {
            let (host, port) = split_host(&host, config.port);
            config.host = host;
            config.port = port;
        }
        if let Some(port) = parsed(&lookup, "SSMPROV_PORT") {
            config.port = port;
        }
        if let Some(dir) = lookup("SSMPROV_CHECKPOINTS") {
            config.checkpoints_dir = expand_home(&dir);
        }
        if let Some(n) = parsed(&lookup, "SSMPROV_MAX_TOKENS") {
            config.max_tokens = n;
        }
        if let Some(secs) = parsed(&lookup, "SSMPROV_MAX_SECONDS") {
            config.max_time = Duration::from_secs(secs);
        }
        if let Some(n) = parsed(&lookup, "SSMPROV_MAX_FRAME") {
            config.max_frame_bytes = n;
        }
        if let Some(flag) = lookup("SSMPROV_KEEP_ALIVE") {
            config.keep_alive = matches!(flag.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(seed) = parsed(&lookup, "SSMPROV_SEED") {
            config.seed = seed;
        }

        config
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn turn_limits(&self) -> TurnLimits {
        TurnLimits {
            max_tokens: self.max_tokens,
            max_time: self.max_time,
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_frame_bytes: self.max_frame_bytes,
            keep_alive: self.keep_alive,
        }
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

/// `host` or `host:port`.
fn split_host(raw: &str, default_port: u16) -> (String, u16) {
    match raw.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(default_port)),
        None => (raw.to_string(), default_port),
    }
}

/// Expands a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
