use proxy_core::{Hash256, ProxyError, ThresholdMode};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process-wide configuration, loaded once at startup from environment
/// variables (§6's "Configuration (environment)"). Per-request overrides
/// are layered on top of these defaults by `RequestConfig` extraction in
/// the HTTP handlers, never threaded through as ambient state (§9).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub backends: Vec<BackendSpec>,
    pub listen_port: u16,
    pub model_id: String,
    pub words_per_block: u32,
    pub similarity_threshold: f64,
    pub big_threshold_mode: ThresholdMode,
    pub min_prefix_words: usize,
    pub min_prefix_chars: usize,
    pub min_prefix_blocks: usize,
    pub metadata_dir: PathBuf,
    pub snapshot_dir: Option<PathBuf>,
    pub pinned_keys: HashSet<Hash256>,
    pub request_timeout: Duration,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub backend_id: String,
    pub base_url: String,
    pub n_slots: usize,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_model_id() -> String {
    "local-model".to_string()
}

fn default_words_per_block() -> u32 {
    4
}

fn default_similarity_threshold() -> f64 {
    0.85
}

fn default_min_prefix_words() -> usize {
    8
}

fn default_min_prefix_chars() -> usize {
    64
}

fn default_min_prefix_blocks() -> usize {
    2
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("./data/metadata")
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ProxyConfig {
    /// Load from environment variables, falling back to defaults for
    /// anything unset. `BACKENDS` is the only required variable.
    pub fn from_env() -> Result<Self, ProxyError> {
        let backends = parse_backends(&env_var("BACKENDS")?)?;

        Ok(Self {
            backends,
            listen_port: env_parse("LISTEN_PORT", default_listen_port())?,
            model_id: std::env::var("MODEL_ID").unwrap_or_else(|_| default_model_id()),
            words_per_block: env_parse("WORDS_PER_BLOCK", default_words_per_block())?,
            similarity_threshold: env_parse("SIMILARITY_THRESHOLD", default_similarity_threshold())?,
            big_threshold_mode: std::env::var("BIG_THRESHOLD_MODE")
                .ok()
                .map(|s| ThresholdMode::from_str(&s))
                .transpose()
                .map_err(ProxyError::InvalidConfig)?
                .unwrap_or(ThresholdMode::Words),
            min_prefix_words: env_parse("MIN_PREFIX_WORDS", default_min_prefix_words())?,
            min_prefix_chars: env_parse("MIN_PREFIX_CHARS", default_min_prefix_chars())?,
            min_prefix_blocks: env_parse("MIN_PREFIX_BLOCKS", default_min_prefix_blocks())?,
            metadata_dir: std::env::var("METADATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_metadata_dir()),
            snapshot_dir: std::env::var("SNAPSHOT_DIR").ok().map(PathBuf::from),
            pinned_keys: parse_pinned_keys(std::env::var("PINNED_KEYS").unwrap_or_default())?,
            request_timeout: std::env::var("REQUEST_TIMEOUT_SECS")
                .ok()
                .map(|s| {
                    s.parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|e| ProxyError::InvalidConfig(e.to_string()))
                })
                .transpose()?
                .unwrap_or_else(default_request_timeout),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
        })
    }
}

fn env_var(name: &str) -> Result<String, ProxyError> {
    std::env::var(name).map_err(|_| ProxyError::InvalidConfig(format!("{name} is required")))
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ProxyError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e: T::Err| ProxyError::InvalidConfig(format!("{name}: {e}"))),
        Err(_) => Ok(default),
    }
}

/// `BACKENDS` is a comma-separated list of `url=n_slots` pairs. The url is
/// used as the backend's stable identifier.
fn parse_backends(raw: &str) -> Result<Vec<BackendSpec>, ProxyError> {
    let mut backends = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (url, n_slots) = entry
            .split_once('=')
            .ok_or_else(|| ProxyError::InvalidConfig(format!("malformed backend entry: {entry}")))?;
        let n_slots: usize = n_slots
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| ProxyError::InvalidConfig(e.to_string()))?;
        backends.push(BackendSpec {
            backend_id: url.trim().to_string(),
            base_url: url.trim().to_string(),
            n_slots,
        });
    }
    if backends.is_empty() {
        return Err(ProxyError::InvalidConfig("BACKENDS is empty".to_string()));
    }
    Ok(backends)
}

fn parse_pinned_keys(raw: String) -> Result<HashSet<Hash256>, ProxyError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|hex| {
            Hash256::from_hex(hex)
                .ok_or_else(|| ProxyError::InvalidConfig(format!("invalid pinned key: {hex}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_backend_entries() {
        let backends = parse_backends("http://a:8080=4,http://b:8080=8").unwrap();
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].n_slots, 4);
        assert_eq!(backends[1].backend_id, "http://b:8080");
    }

    #[test]
    fn rejects_empty_backends() {
        assert!(parse_backends("").is_err());
    }

    #[test]
    fn rejects_malformed_entry() {
        assert!(parse_backends("http://a:8080").is_err());
    }
}
