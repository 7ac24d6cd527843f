//! Configuration file parser for ~/.config/memefeed/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
///
/// Custom Debug impl masks `api_key` so it never reaches logs.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the data-access API (no trailing slash required).
    pub api_base_url: String,

    /// API key for the data-access API (alternative to MEMEFEED_API_KEY env var).
    /// Env var takes precedence over config file.
    pub api_key: Option<String>,

    /// Items requested per page.
    pub page_size: u32,

    pub viewport: ViewportConfig,
    pub scroll: ScrollConfig,
    pub prefetch: PrefetchConfig,
    pub cache: CacheConfig,
}

/// Load-more trigger tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// Distance from the document bottom (logical px) that counts as "near the end".
    pub threshold_px: f64,
    /// Minimum spacing between two load-more calls.
    pub rate_limit_ms: u64,
    /// Delay before the mount-time and post-update re-checks run.
    pub settle_delay_ms: u64,
}

/// Scroll restoration tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrollConfig {
    /// Saved offsets older than this are discarded.
    pub ttl_minutes: u64,
    /// Quiet period after the last scroll event before a save.
    pub debounce_ms: u64,
    /// Length of one paint frame; restores jump after one frame.
    pub frame_ms: u64,
}

/// Image prefetch tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub timeout_ms: u64,
    /// How many leading URLs of a batch are loaded immediately.
    pub high_priority: usize,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Coalescing window for feed cache writes. 0 = flush on the next scheduler tick.
    pub persist_debounce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            api_key: None,
            page_size: 20,
            viewport: ViewportConfig::default(),
            scroll: ScrollConfig::default(),
            prefetch: PrefetchConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            threshold_px: 800.0,
            rate_limit_ms: 1000,
            settle_delay_ms: 100,
        }
    }
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: 30,
            debounce_ms: 100,
            frame_ms: 16,
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            high_priority: 3,
            batch_size: 3,
            batch_delay_ms: 100,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persist_debounce_ms: 0,
        }
    }
}

/// Mask api_key in Debug output to prevent secret leakage.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("page_size", &self.page_size)
            .field("viewport", &self.viewport)
            .field("scroll", &self.scroll)
            .field("prefetch", &self.prefetch)
            .field("cache", &self.cache)
            .finish()
    }
}

impl Config {
    /// API key for the data-access API. `MEMEFEED_API_KEY` wins over the file.
    pub fn resolved_api_key(&self) -> Option<SecretString> {
        std::env::var("MEMEFEED_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone())
            .map(SecretString::from)
    }
}

impl ViewportConfig {
    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl ScrollConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.saturating_mul(60))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn frame(&self) -> Duration {
        Duration::from_millis(self.frame_ms)
    }
}

impl CacheConfig {
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

impl PrefetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to avoid loading a runaway file.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse as a raw table first to detect unknown top-level keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "api_base_url",
                "api_key",
                "page_size",
                "viewport",
                "scroll",
                "prefetch",
                "cache",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            api = %config.api_base_url,
            page_size = config.page_size,
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
