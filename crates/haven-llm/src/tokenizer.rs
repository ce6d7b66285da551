use std::sync::Arc;

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use haven_core::error::GatewayError;

/// Shared BPE tokenizer keyed by model family.
///
/// Used wherever a provider does not attest token counts itself: pre-flight
/// context checks and user-message accounting. The encoders are expensive to
/// build, so one instance is constructed at startup and shared via Arc.
pub struct Tokenizer {
    cl100k: CoreBPE,
    o200k: CoreBPE,
}

impl Tokenizer {
    pub fn new() -> Result<Arc<Self>, GatewayError> {
        let cl100k = cl100k_base()
            .map_err(|e| GatewayError::configuration("TOKENIZER_INIT", e.to_string()))?;
        let o200k = o200k_base()
            .map_err(|e| GatewayError::configuration("TOKENIZER_INIT", e.to_string()))?;
        Ok(Arc::new(Self { cl100k, o200k }))
    }

    /// Count tokens in `text` under the encoding for `model`'s family.
    pub fn count(&self, model: &str, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        self.encoder_for(model).encode_with_special_tokens(text).len() as u32
    }

    /// Newer OpenAI families use the o200k vocabulary; everything else gets
    /// cl100k, which is a reasonable estimate for open-weight chat models too.
    fn encoder_for(&self, model: &str) -> &CoreBPE {
        let name = model.to_ascii_lowercase();
        if name.contains("gpt-4o")
            || name.contains("gpt-5")
            || name.starts_with("o1")
            || name.starts_with("o3")
        {
            &self.o200k
        } else {
            &self.cl100k
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_counts_zero() {
        let t = Tokenizer::new().unwrap();
        assert_eq!(t.count("m-small", ""), 0);
    }

    #[test]
    fn counts_are_positive_and_monotonic() {
        let t = Tokenizer::new().unwrap();
        let short = t.count("m-small", "Hi");
        let long = t.count("m-small", "Hi there, this is a longer sentence about tokenizers.");
        assert!(short >= 1);
        assert!(long > short);
    }

    #[test]
    fn family_selection_does_not_panic() {
        let t = Tokenizer::new().unwrap();
        for model in ["gpt-4o-mini", "o1-preview", "llama3.2", "claude-sonnet-4"] {
            assert!(t.count(model, "hello world") >= 1);
        }
    }
}
