use serde_json::json;

use haven_core::error::GatewayError;

use crate::provider::ModelDescriptor;

/// Pre-flight context check run before any provider dispatch.
///
/// Projects the turn's total token load and rejects it when the model's
/// window minus reserved output headroom cannot hold it.
pub struct ContextGuard {
    output_headroom_tokens: u32,
}

impl ContextGuard {
    pub fn new(output_headroom_tokens: u32) -> Self {
        Self {
            output_headroom_tokens,
        }
    }

    pub fn check(
        &self,
        model: &ModelDescriptor,
        current_tokens: u64,
        incoming_tokens: u32,
        system_tokens: u32,
        max_tokens: Option<u32>,
    ) -> Result<(), GatewayError> {
        let headroom = self
            .output_headroom_tokens
            .max(max_tokens.unwrap_or(0)) as u64;
        let limit = model.context_window as u64;
        let projected = current_tokens + incoming_tokens as u64 + system_tokens as u64;

        if projected > limit.saturating_sub(headroom) {
            return Err(GatewayError::context_limit(
                json!({
                    "current_tokens": current_tokens,
                    "incoming_tokens": incoming_tokens + system_tokens,
                    "projected_total": projected,
                    "limit": limit,
                    "model": model.name,
                }),
                vec![
                    "Start a new conversation".to_string(),
                    format!(
                        "Use a model with a larger context window (current: {})",
                        limit
                    ),
                    "Shorten your message".to_string(),
                ],
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ModelCapabilities, ModelStatus};

    fn model(window: u32) -> ModelDescriptor {
        ModelDescriptor {
            name: "m-small".to_string(),
            provider: "local".to_string(),
            context_window: window,
            capabilities: ModelCapabilities {
                streaming: true,
                tools: false,
                reasoning: false,
            },
            status: ModelStatus::Available,
        }
    }

    #[test]
    fn within_budget_passes() {
        let guard = ContextGuard::new(512);
        assert!(guard.check(&model(4096), 1000, 200, 0, None).is_ok());
    }

    #[test]
    fn overflow_is_rejected_with_details() {
        let guard = ContextGuard::new(512);
        let err = guard.check(&model(4096), 4000, 200, 0, None).unwrap_err();
        assert_eq!(err.code, "CONTEXT_OVERFLOW");
        assert_eq!(err.status(), 413);
        let details = err.details.as_ref().unwrap();
        assert_eq!(details["projected_total"], 4200);
        assert_eq!(details["limit"], 4096);
        assert_eq!(details["model"], "m-small");
        assert_eq!(err.suggestions.len(), 3);
    }

    #[test]
    fn headroom_counts_against_budget() {
        let guard = ContextGuard::new(512);
        // 3600 + 200 = 3800 > 4096 - 512 = 3584 → reject even though the
        // window itself would fit.
        assert!(guard.check(&model(4096), 3600, 200, 0, None).is_err());
    }

    #[test]
    fn caller_max_tokens_wins_when_larger() {
        let guard = ContextGuard::new(512);
        // With default headroom this passes; a 2000-token reservation tips it.
        assert!(guard.check(&model(4096), 2000, 100, 0, None).is_ok());
        assert!(guard.check(&model(4096), 2000, 100, 0, Some(2000)).is_err());
    }

    #[test]
    fn system_prompt_tokens_are_projected() {
        let guard = ContextGuard::new(512);
        assert!(guard.check(&model(4096), 3400, 100, 200, None).is_err());
        assert!(guard.check(&model(4096), 3200, 100, 200, None).is_ok());
    }
}
