//! Pre-flight trimming of conversation history into a model's context budget
use crate::errors::CoreError;
use crate::models::{ChatMessage, MessageRole};
use crate::providers::{ProviderMetadata, ProviderRole};
use tracing::debug;

/// Output allowance subtracted from the context window when none is configured.
pub const DEFAULT_RESERVED_OUTPUT_TOKENS: u64 = 2_000;

/// Fixed per-message cost for role tags and separators.
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Rough token count for a piece of text, using the four-characters-per-token heuristic.
pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

pub fn estimate_message_tokens(message: &ChatMessage) -> u64 {
    estimate_text_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS
}

fn estimate_system_tokens(system_prompt: &str) -> u64 {
    if system_prompt.is_empty() {
        0
    } else {
        estimate_text_tokens(system_prompt) + MESSAGE_OVERHEAD_TOKENS
    }
}

/// Estimated tokens for a full request: the system prompt plus every message.
pub fn estimate_context_tokens(messages: &[ChatMessage], system_prompt: &str) -> u64 {
    estimate_system_tokens(system_prompt)
        + messages.iter().map(estimate_message_tokens).sum::<u64>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindowManager {
    reserved_output_tokens: u64,
}

impl Default for ContextWindowManager {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVED_OUTPUT_TOKENS)
    }
}

impl ContextWindowManager {
    pub fn new(reserved_output_tokens: u64) -> Self {
        Self {
            reserved_output_tokens,
        }
    }

    pub fn reserved_output_tokens(&self) -> u64 {
        self.reserved_output_tokens
    }

    /// Input tokens available for `metadata`'s model once the output allowance is set aside.
    pub fn budget(&self, metadata: &ProviderMetadata) -> u64 {
        metadata
            .context_window
            .saturating_sub(self.reserved_output_tokens)
    }

    /// Drop the oldest non-system messages until the conversation fits the role's budget.
    ///
    /// The system prompt and any system-tagged messages are never dropped. Newer messages always
    /// survive older ones, and a context that already fits is returned unchanged, so trimming twice
    /// gives the same result as trimming once.
    pub fn trim_to_fit(
        &self,
        messages: &[ChatMessage],
        system_prompt: &str,
        role: ProviderRole,
        metadata: &ProviderMetadata,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        let budget = self.budget(metadata);
        let system_tokens = estimate_system_tokens(system_prompt);
        if system_tokens > budget {
            return Err(CoreError::ContextTooLarge {
                role,
                required_tokens: system_tokens,
                budget_tokens: budget,
            });
        }

        let mut total = system_tokens
            + messages
                .iter()
                .map(estimate_message_tokens)
                .sum::<u64>();
        if total <= budget {
            return Ok(messages.to_vec());
        }

        let mut keep = vec![true; messages.len()];
        for (i, message) in messages.iter().enumerate() {
            if total <= budget {
                break;
            }
            if message.role == MessageRole::System {
                continue;
            }
            keep[i] = false;
            total -= estimate_message_tokens(message);
        }

        if total > budget {
            // Only pinned system messages are left and they still overflow
            return Err(CoreError::ContextTooLarge {
                role,
                required_tokens: total,
                budget_tokens: budget,
            });
        }

        let trimmed: Vec<ChatMessage> = messages
            .iter()
            .zip(keep)
            .filter_map(|(message, kept)| kept.then(|| message.clone()))
            .collect();
        debug!(
            role = %role,
            dropped = messages.len() - trimmed.len(),
            estimated_tokens = total,
            budget_tokens = budget,
            "Trimmed conversation to fit context window"
        );
        Ok(trimmed)
    }
}
