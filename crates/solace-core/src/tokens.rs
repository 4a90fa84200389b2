//! Token estimation without a real tokenizer.
//!
//! The provider does not expose client-side tokenization, so quota accounting
//! uses the ~4 characters per token approximation. Deliberately conservative:
//! better to under-fill a window than to trip a quota error mid-turn.

use crate::conversation::WireMessage;

/// Assumed reply length in characters when estimating output cost.
pub const AVG_RESPONSE_CHARS: usize = 200;

/// Estimated token cost of one queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// ~4 characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4) as u32
}

/// Token cost of one wire message: role plus every part text.
pub fn estimate_message_tokens(message: &WireMessage) -> u32 {
    let mut total = estimate_tokens(&message.role);
    for part in &message.parts {
        total += estimate_tokens(&part.text);
    }
    total
}

/// Token cost of a full context, with a fixed allowance for the reply.
pub fn estimate_conversation_tokens(messages: &[WireMessage]) -> TokenEstimate {
    let input_tokens: u32 = messages.iter().map(estimate_message_tokens).sum();
    let output_tokens = estimate_tokens(&"x".repeat(AVG_RESPONSE_CHARS));
    TokenEstimate {
        input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_chars_per_token_rounded_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn conversation_estimate_sums_messages() {
        let messages = vec![
            WireMessage::new("user", "hello there"), // 1 + 3 tokens
            WireMessage::new("model", "hi"),         // 2 + 1 tokens
        ];
        let estimate = estimate_conversation_tokens(&messages);
        assert_eq!(estimate.input_tokens, 7);
        assert_eq!(estimate.output_tokens, 50);
        assert_eq!(estimate.total_tokens, 57);
    }
}
