use crate::config::ProxyConfig;
use axum::http::HeaderMap;
use proxy_core::{RequestConfig, ThresholdMode};
use std::collections::HashMap;
use std::str::FromStr;

/// Build a per-request `RequestConfig` from headers and query params,
/// headers taking precedence, falling back to `ProxyConfig` defaults
/// (§6's "Request-scoped configuration", §9's Design Note).
pub fn extract(headers: &HeaderMap, query: &HashMap<String, String>, cfg: &ProxyConfig) -> RequestConfig {
    let words_per_block = header_or_query(headers, query, "x-block-size", "block_size")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|n| (1..=2048).contains(n))
        .unwrap_or(cfg.words_per_block);

    let threshold_mode = header_or_query(headers, query, "x-threshold-mode", "threshold_mode")
        .and_then(|v| ThresholdMode::from_str(&v).ok())
        .unwrap_or(cfg.big_threshold_mode);

    let min_prefix_words = header_or_query(headers, query, "x-min-prefix-words", "min_prefix_words")
        .and_then(|v| v.parse().ok())
        .unwrap_or(cfg.min_prefix_words);

    let min_prefix_chars = header_or_query(headers, query, "x-min-prefix-chars", "min_prefix_chars")
        .and_then(|v| v.parse().ok())
        .unwrap_or(cfg.min_prefix_chars);

    let min_prefix_blocks = header_or_query(headers, query, "x-min-prefix-blocks", "min_prefix_blocks")
        .and_then(|v| v.parse().ok())
        .unwrap_or(cfg.min_prefix_blocks);

    RequestConfig {
        words_per_block,
        threshold_mode,
        min_prefix_words,
        min_prefix_chars,
        min_prefix_blocks,
        similarity_threshold: cfg.similarity_threshold,
    }
}

fn header_or_query(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    header_name: &str,
    query_name: &str,
) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get(query_name).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn base_config() -> ProxyConfig {
        ProxyConfig {
            backends: vec![],
            listen_port: 8080,
            model_id: "m1".to_string(),
            words_per_block: 4,
            similarity_threshold: 0.85,
            big_threshold_mode: ThresholdMode::Words,
            min_prefix_words: 8,
            min_prefix_chars: 64,
            min_prefix_blocks: 2,
            metadata_dir: "/tmp".into(),
            snapshot_dir: None,
            pinned_keys: Default::default(),
            request_timeout: std::time::Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn falls_back_to_config_defaults() {
        let cfg = base_config();
        let rc = extract(&HeaderMap::new(), &HashMap::new(), &cfg);
        assert_eq!(rc.words_per_block, 4);
    }

    #[test]
    fn header_overrides_query_and_default() {
        let cfg = base_config();
        let mut headers = HeaderMap::new();
        headers.insert("x-block-size", HeaderValue::from_static("8"));
        let mut query = HashMap::new();
        query.insert("block_size".to_string(), "16".to_string());
        let rc = extract(&headers, &query, &cfg);
        assert_eq!(rc.words_per_block, 8);
    }

    #[test]
    fn out_of_range_block_size_falls_back_to_default() {
        let cfg = base_config();
        let mut headers = HeaderMap::new();
        headers.insert("x-block-size", HeaderValue::from_static("99999"));
        let rc = extract(&headers, &HashMap::new(), &cfg);
        assert_eq!(rc.words_per_block, 4);
    }
}
