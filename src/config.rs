//! Configuration types for the OCR pipeline.
//!
//! Pipeline behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. The vision-model engine has its own
//! [`VisionOcrConfig`] because it is only one of several possible engines.
//!
//! Both structs are plain values: the loading mechanism (flags, env, files)
//! belongs to the caller. The `pdfocr` binary maps CLI flags onto the
//! builders.

use crate::error::ServiceError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the document pipeline.
///
/// # Example
/// ```rust
/// use edgequake_ocr::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .dpi(200)
///     .workers(4)
///     .max_retries(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.workers, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Rasterisation DPI. Range: 72–600. Default: 300.
    ///
    /// 300 DPI is the usual floor for reliable glyph recognition on body
    /// text; below 150 small print starts to merge.
    pub dpi: u32,

    /// Cap on either rendered dimension in pixels. Default: 4000.
    ///
    /// Independent of DPI: a 300-DPI A0 poster would otherwise allocate a
    /// ~10 000 × 14 000 px bitmap.
    pub max_rendered_pixels: u32,

    /// Documents declaring more pages than this fail with
    /// `ResourceExhausted` before any page is rendered. Default: 500.
    pub max_pages: usize,

    /// Size of the global worker pool shared by every in-flight document.
    /// Default: available parallelism.
    pub workers: usize,

    /// Depth of the rasteriser's hand-off channel, and how many page tasks
    /// per document may queue for a worker beyond `workers`. Default: 4.
    pub page_buffer: usize,

    /// OCR retries per page after the first attempt. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per retry. Default: 500.
    pub retry_backoff_ms: u64,

    /// How long finished jobs stay queryable, in seconds. Default: 3600.
    /// At most [`MAX_RETENTION_SECS`].
    pub retention_secs: u64,

    /// How often the reaper sweeps expired jobs, in seconds. Default: 60.
    pub reaper_interval_secs: u64,
}

/// Upper bound on `retention_secs`: one year.
pub const MAX_RETENTION_SECS: u64 = 365 * 24 * 60 * 60;

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 4000,
            max_pages: 500,
            workers: default_workers(),
            page_buffer: 4,
            max_retries: 2,
            retry_backoff_ms: 500,
            retention_secs: 3600,
            reaper_interval_secs: 60,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.max(1);
        self
    }

    pub fn page_buffer(mut self, n: usize) -> Self {
        self.config.page_buffer = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn retention_secs(mut self, secs: u64) -> Self {
        self.config.retention_secs = secs;
        self
    }

    pub fn reaper_interval_secs(mut self, secs: u64) -> Self {
        self.config.reaper_interval_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ServiceError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(ServiceError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.workers == 0 {
            return Err(ServiceError::InvalidConfig("Workers must be ≥ 1".into()));
        }
        if c.max_pages == 0 {
            return Err(ServiceError::InvalidConfig("max_pages must be ≥ 1".into()));
        }
        if c.page_buffer == 0 {
            return Err(ServiceError::InvalidConfig(
                "page_buffer must be ≥ 1".into(),
            ));
        }
        if c.retention_secs > MAX_RETENTION_SECS {
            return Err(ServiceError::InvalidConfig(format!(
                "retention_secs must be ≤ {MAX_RETENTION_SECS}, got {}",
                c.retention_secs
            )));
        }
        Ok(self.config)
    }
}

/// Model used when a provider is chosen but no model is named.
pub const DEFAULT_VISION_MODEL: &str = "gpt-4.1-nano";

/// Configuration for [`crate::pipeline::ocr::VisionOcrEngine`].
#[derive(Clone)]
pub struct VisionOcrConfig {
    /// Model identifier. If None, [`DEFAULT_VISION_MODEL`] (or the
    /// auto-detected provider's default).
    pub model: Option<String>,

    /// Provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens generated per page. Default: 4096.
    pub max_tokens: usize,

    /// Per-call timeout in seconds. A timeout counts as an engine failure.
    /// Default: 60.
    pub api_timeout_secs: u64,

    /// Custom system prompt. If None, uses [`crate::prompts::OCR_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,

    /// Confidence reported when the model omits its `CONFIDENCE:` line.
    /// Default: 0.5.
    pub fallback_confidence: f32,

    /// Send pages as 8-bit greyscale. Default: true.
    pub grayscale: bool,
}

impl Default for VisionOcrConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            api_timeout_secs: 60,
            system_prompt: None,
            fallback_confidence: 0.5,
            grayscale: true,
        }
    }
}

impl fmt::Debug for VisionOcrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionOcrConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("fallback_confidence", &self.fallback_confidence)
            .field("grayscale", &self.grayscale)
            .finish()
    }
}

impl VisionOcrConfig {
    pub fn builder() -> VisionOcrConfigBuilder {
        VisionOcrConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn model_or_default(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_VISION_MODEL)
    }

    /// The `(provider, model)` pair to construct when no provider instance
    /// is set, or `None` to auto-detect.
    ///
    /// Order: `provider_name`, then `EDGEQUAKE_LLM_PROVIDER` together with
    /// `EDGEQUAKE_MODEL`, then OpenAI whenever `OPENAI_API_KEY` is set (so
    /// several configured keys resolve predictably).
    pub fn provider_route(&self) -> Option<(String, String)> {
        if let Some(ref name) = self.provider_name {
            return Some((name.clone(), self.model_or_default().to_string()));
        }
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        if let (Some(provider), Some(model)) =
            (env("EDGEQUAKE_LLM_PROVIDER"), env("EDGEQUAKE_MODEL"))
        {
            return Some((provider, model));
        }
        env("OPENAI_API_KEY").map(|_| ("openai".to_string(), self.model_or_default().to_string()))
    }

    /// The error reported when `provider` cannot be constructed.
    pub(crate) fn provider_error(provider: &str, cause: impl fmt::Display) -> ServiceError {
        let hint = match provider {
            "auto" => format!(
                "No LLM provider auto-detected ({cause}). Set OPENAI_API_KEY, \
                 ANTHROPIC_API_KEY or GEMINI_API_KEY, or pass --provider"
            ),
            _ => format!("{cause}. Check the API key for '{provider}' and that the model supports images"),
        };
        ServiceError::ProviderNotConfigured {
            provider: provider.to_string(),
            hint,
        }
    }
}

/// Builder for [`VisionOcrConfig`].
#[derive(Debug)]
pub struct VisionOcrConfigBuilder {
    config: VisionOcrConfig,
}

impl VisionOcrConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn fallback_confidence(mut self, c: f32) -> Self {
        self.config.fallback_confidence = c.clamp(0.0, 1.0);
        self
    }

    pub fn grayscale(mut self, on: bool) -> Self {
        self.config.grayscale = on;
        self
    }

    pub fn build(self) -> Result<VisionOcrConfig, ServiceError> {
        if self.config.max_tokens == 0 {
            return Err(ServiceError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if self.config.api_timeout_secs == 0 {
            return Err(ServiceError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let c = PipelineConfig::default();
        assert_eq!(c.dpi, 300);
        assert_eq!(c.max_pages, 500);
        assert_eq!(c.max_retries, 2);
        assert_eq!(c.retry_backoff_ms, 500);
        assert_eq!(c.retention_secs, 3600);
        assert!(c.workers >= 1);
    }

    #[test]
    fn builder_clamps_dpi_and_workers() {
        let c = PipelineConfig::builder()
            .dpi(10_000)
            .workers(0)
            .build()
            .unwrap();
        assert_eq!(c.dpi, 600);
        assert_eq!(c.workers, 1);
    }

    #[test]
    fn zero_max_pages_is_rejected() {
        let err = PipelineConfig::builder().max_pages(0).build().unwrap_err();
        assert!(matches!(err, ServiceError::InvalidConfig(_)));
    }

    #[test]
    fn retention_beyond_a_year_is_rejected() {
        let err = PipelineConfig::builder()
            .retention_secs(u64::MAX)
            .build()
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidConfig(_)));
        let ok = PipelineConfig::builder()
            .retention_secs(MAX_RETENTION_SECS)
            .build()
            .unwrap();
        assert_eq!(ok.retention(), Duration::from_secs(MAX_RETENTION_SECS));
    }

    #[test]
    fn named_provider_routes_with_default_model() {
        let c = VisionOcrConfig::builder().provider_name("ollama").build().unwrap();
        assert_eq!(
            c.provider_route(),
            Some(("ollama".to_string(), DEFAULT_VISION_MODEL.to_string()))
        );
        let c = VisionOcrConfig::builder()
            .provider_name("anthropic")
            .model("claude-3-5-haiku")
            .build()
            .unwrap();
        assert_eq!(
            c.provider_route(),
            Some(("anthropic".to_string(), "claude-3-5-haiku".to_string()))
        );
    }

    #[test]
    fn backoff_doubles() {
        let c = PipelineConfig::builder().retry_backoff_ms(100).build().unwrap();
        assert_eq!(c.backoff_for(1), Duration::from_millis(100));
        assert_eq!(c.backoff_for(2), Duration::from_millis(200));
        assert_eq!(c.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn vision_config_debug_hides_provider() {
        let c = VisionOcrConfig::default();
        let dbg = format!("{c:?}");
        assert!(dbg.contains("VisionOcrConfig"));
        assert!(dbg.contains("fallback_confidence"));
    }

    #[test]
    fn vision_builder_clamps_confidence() {
        let c = VisionOcrConfig::builder()
            .fallback_confidence(3.0)
            .build()
            .unwrap();
        assert_eq!(c.fallback_confidence, 1.0);
    }
}
