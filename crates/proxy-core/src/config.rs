use serde::{Deserialize, Serialize};

/// Which dimension of the prefix decides "big" vs "small" (§4.5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    Words,
    Chars,
    Blocks,
}

impl std::str::FromStr for ThresholdMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "words" => Ok(Self::Words),
            "chars" => Ok(Self::Chars),
            "blocks" => Ok(Self::Blocks),
            other => Err(format!("unknown threshold mode: {other}")),
        }
    }
}

/// Per-request parameters assembled from headers/query params with defaults
/// falling back to the process-wide configuration (§9 Design Notes: "do not
/// thread them through as ambient state").
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub words_per_block: u32,
    pub threshold_mode: ThresholdMode,
    pub min_prefix_words: usize,
    pub min_prefix_chars: usize,
    pub min_prefix_blocks: usize,
    pub similarity_threshold: f64,
}

impl RequestConfig {
    /// Classify a request as big or small. The boundary is strict `>`
    /// (§8: "exactly `big_threshold` words (boundary is strict `>`)").
    pub fn is_big(&self, word_count: usize, char_count: usize, block_count: usize) -> bool {
        match self.threshold_mode {
            ThresholdMode::Words => word_count > self.min_prefix_words,
            ThresholdMode::Chars => char_count > self.min_prefix_chars,
            ThresholdMode::Blocks => block_count > self.min_prefix_blocks,
        }
    }
}
