use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Shared secret compared against `hello.token`. Empty means the server
    /// refuses to start.
    pub auth_token: String,
    /// How long a fresh connection may sit without a valid `hello`.
    pub hello_timeout: Duration,
    /// Per-terminal backlog retention, in bytes.
    pub backlog_max_bytes: usize,
    /// Replay payloads above this size are delivered as a chunked unit.
    pub snapshot_chunk_bytes: usize,
    /// How long an exited terminal with no viewers is kept attachable.
    pub exited_grace: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            host: env::var("FRESHELL_HOST").unwrap_or(defaults.host),
            port: env::var("FRESHELL_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            auth_token: env::var("AUTH_TOKEN").unwrap_or(defaults.auth_token),
            hello_timeout: env::var("FRESHELL_HELLO_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.hello_timeout),
            backlog_max_bytes: env::var("FRESHELL_BACKLOG_MAX_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.backlog_max_bytes),
            snapshot_chunk_bytes: env::var("FRESHELL_SNAPSHOT_CHUNK_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.snapshot_chunk_bytes),
            exited_grace: env::var("FRESHELL_EXITED_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.exited_grace),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8077,
            auth_token: String::new(),
            hello_timeout: Duration::from_secs(10),
            backlog_max_bytes: 2 * 1024 * 1024,
            snapshot_chunk_bytes: 64 * 1024,
            exited_grace: Duration::from_secs(300),
        }
    }
}

/// Abbreviate a token for logs. Tokens are never logged raw.
pub fn token_fingerprint(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    let keep = if chars.len() <= 16 { 4 } else { 8 };
    let head: String = chars.iter().take(keep.min(chars.len())).collect();
    let tail: String = chars[chars.len().saturating_sub(keep)..].iter().collect();
    format!("{head}...{tail}")
}
