//! OCR adapter: one page image in, text plus confidence out.
//!
//! [`OcrEngine`] is the seam the page processor calls through. Engines are
//! invoked from blocking worker threads, never from async tasks, so
//! `recognize` is a plain blocking call.
//!
//! Engines that need `&mut self` (most native OCR libraries keep scratch
//! buffers per instance) implement [`ExclusiveOcrEngine`] and are wrapped in
//! [`SerializedEngine`]; callers cannot tell the difference.
//!
//! [`VisionOcrEngine`] is the bundled production engine. It sends the page to
//! a multimodal model through `edgequake-llm` and parses the transcript.

use crate::config::VisionOcrConfig;
use crate::error::{OcrError, ServiceError};
use crate::pipeline::{encode, transcript};
use crate::prompts::OCR_SYSTEM_PROMPT;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::debug;

/// Successful recognition of one page.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    /// Text with engine confidence in `[0, 1]`.
    Text { text: String, confidence: f32 },
    /// No recognisable text. Not a failure.
    EmptyPage,
}

/// A recognition engine safe to call from many worker threads at once.
pub trait OcrEngine: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Recognise one page. Blocks the calling thread.
    ///
    /// Any `Err` is treated as transient and retried by the page processor.
    fn recognize(&self, image: &DynamicImage) -> Result<Recognition, OcrError>;
}

impl<E: OcrEngine + ?Sized> OcrEngine for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn recognize(&self, image: &DynamicImage) -> Result<Recognition, OcrError> {
        (**self).recognize(image)
    }
}

/// An engine that requires exclusive access per call.
pub trait ExclusiveOcrEngine: Send {
    fn name(&self) -> &str;
    fn recognize(&mut self, image: &DynamicImage) -> Result<Recognition, OcrError>;
}

/// Makes an [`ExclusiveOcrEngine`] shareable by serialising calls.
pub struct SerializedEngine<E> {
    name: String,
    inner: Mutex<E>,
}

impl<E: ExclusiveOcrEngine> SerializedEngine<E> {
    pub fn new(engine: E) -> Self {
        Self {
            name: engine.name().to_string(),
            inner: Mutex::new(engine),
        }
    }

    pub fn into_inner(self) -> E {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: ExclusiveOcrEngine> OcrEngine for SerializedEngine<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn recognize(&self, image: &DynamicImage) -> Result<Recognition, OcrError> {
        // A panic inside a previous call leaves no partial state we rely on.
        let mut engine = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        engine.recognize(image)
    }
}

/// Vision-model OCR over any `edgequake-llm` provider.
///
/// Must be constructed inside a Tokio runtime: the async provider call is
/// driven from worker threads through the captured runtime handle.
pub struct VisionOcrEngine {
    provider: Arc<dyn LLMProvider>,
    config: VisionOcrConfig,
    runtime: Handle,
    name: String,
}

impl std::fmt::Debug for VisionOcrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionOcrEngine")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl VisionOcrEngine {
    pub fn new(config: VisionOcrConfig) -> Result<Self, ServiceError> {
        let runtime = Handle::try_current().map_err(|e| {
            ServiceError::Internal(format!("VisionOcrEngine needs a Tokio runtime: {e}"))
        })?;
        let provider = resolve_provider(&config)?;
        let name = format!(
            "vision:{}",
            config
                .model
                .as_deref()
                .or(config.provider_name.as_deref())
                .unwrap_or("auto")
        );
        Ok(Self {
            provider,
            config,
            runtime,
            name,
        })
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            ..Default::default()
        }
    }
}

impl OcrEngine for VisionOcrEngine {
    fn name(&self) -> &str {
        &self.name
    }

    /// One chat call per page. The user turn carries only the image; the
    /// system prompt says what to do with it.
    fn recognize(&self, image: &DynamicImage) -> Result<Recognition, OcrError> {
        let start = Instant::now();
        let image_data = encode::encode_page(image, self.config.grayscale)?;
        let system_prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(OCR_SYSTEM_PROMPT);
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user_with_images("", vec![image_data]),
        ];
        let options = self.options();
        let limit = Duration::from_secs(self.config.api_timeout_secs);

        let response = self
            .runtime
            .block_on(async {
                tokio::time::timeout(limit, self.provider.chat(&messages, Some(&options))).await
            })
            .map_err(|_| {
                OcrError::engine(format!(
                    "vision call timed out after {}s",
                    self.config.api_timeout_secs
                ))
            })?
            .map_err(|e| OcrError::engine(e.to_string()))?;

        debug!(
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Vision call finished"
        );

        Ok(transcript::parse_transcript(
            &response.content,
            self.config.fallback_confidence,
        ))
    }
}

/// Build the provider a [`VisionOcrEngine`] talks to.
///
/// A provider instance in the config wins; otherwise the config's
/// [`provider_route`](VisionOcrConfig::provider_route) names one, and with no
/// route `ProviderFactory::from_env` picks whatever credentials it finds.
pub fn resolve_provider(config: &VisionOcrConfig) -> Result<Arc<dyn LLMProvider>, ServiceError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }
    match config.provider_route() {
        Some((provider, model)) => {
            debug!(provider = %provider, model = %model, "Creating vision provider");
            ProviderFactory::create_llm_provider(&provider, &model)
                .map_err(|e| VisionOcrConfig::provider_error(&provider, e))
        }
        None => ProviderFactory::from_env()
            .map(|(provider, _)| provider)
            .map_err(|e| VisionOcrConfig::provider_error("auto", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts how many callers are inside `recognize` at once.
    struct Scratch {
        inside: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl ExclusiveOcrEngine for Scratch {
        fn name(&self) -> &str {
            "scratch"
        }

        fn recognize(&mut self, _image: &DynamicImage) -> Result<Recognition, OcrError> {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            self.inside.fetch_sub(1, Ordering::SeqCst);
            Ok(Recognition::EmptyPage)
        }
    }

    #[test]
    fn serialized_engine_never_overlaps_calls() {
        let peak = Arc::new(AtomicUsize::new(0));
        let engine = Arc::new(SerializedEngine::new(Scratch {
            inside: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        }));
        assert_eq!(engine.name(), "scratch");

        let image = DynamicImage::new_luma8(4, 4);
        std::thread::scope(|s| {
            for _ in 0..6 {
                let engine = Arc::clone(&engine);
                let image = &image;
                s.spawn(move || engine.recognize(image).unwrap());
            }
        });
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn vision_engine_requires_runtime() {
        let err = VisionOcrEngine::new(VisionOcrConfig::default()).unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));
    }
}
