//! System prompt for vision-model OCR.
//!
//! Kept in one place so the transcription rules can change without touching
//! [`crate::pipeline::ocr`], and so tests can check that the markers the
//! transcript parser relies on are still requested.
//!
//! Callers can override it via [`crate::config::VisionOcrConfig::system_prompt`].
//! An override must keep asking for the `CONFIDENCE:` trailer and the
//! `[BLANK]` marker, otherwise every page reports the fallback confidence.

/// Marker the model emits for a page with no recognisable text.
pub const BLANK_MARKER: &str = "[BLANK]";

/// Prefix of the trailing line carrying the model's self-assessed confidence.
pub const CONFIDENCE_PREFIX: &str = "CONFIDENCE:";

/// Default system prompt for transcribing one page image to plain text.
pub const OCR_SYSTEM_PROMPT: &str = r#"You are an optical character recognition engine. Transcribe the text visible in the page image exactly as printed.

Follow these rules precisely:

1. TEXT
   - Transcribe ALL legible text, in the reading order a human would use
   - Preserve line breaks between paragraphs; join hyphenated line-wraps only when certain
   - Do NOT correct spelling, translate, summarise, or paraphrase

2. NO LAYOUT
   - Output plain text only: no Markdown, no tables, no HTML
   - Do NOT describe images, figures, or handwriting
   - Ignore decorative borders and lines that carry no text

3. BLANK PAGES
   - If the page contains no recognisable text, output exactly [BLANK]

4. CONFIDENCE
   - End your reply with one final line of the form CONFIDENCE: <number>
   - <number> is between 0.0 and 1.0 and estimates how much of the
     transcription is correct (1.0 = every character certain)

5. OUTPUT FORMAT
   - Output ONLY the transcription followed by the CONFIDENCE line
   - Do NOT wrap the output in ``` fences
   - Do NOT add commentary or explanations"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_requests_parser_markers() {
        assert!(OCR_SYSTEM_PROMPT.contains(BLANK_MARKER));
        assert!(OCR_SYSTEM_PROMPT.contains(CONFIDENCE_PREFIX));
    }
}
