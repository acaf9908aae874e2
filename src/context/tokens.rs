//! Token estimation
//!
//! Providers tokenize differently, so budgets are enforced against a stable
//! estimate: one token per four characters, rounded up, plus a fixed
//! overhead for each chat message's role framing.

use crate::conversation::{Message, Turn};

/// Tokens charged per message for role formatting
pub const MESSAGE_OVERHEAD: usize = 4;

/// Estimate the tokens in a piece of text
pub fn estimate(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Estimate a single chat message, including role overhead
pub fn estimate_message(message: &Message) -> usize {
    estimate(&message.content) + MESSAGE_OVERHEAD
}

/// Estimate a list of chat messages
pub fn estimate_messages(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message).sum()
}

/// Estimate a transcript turn as it would appear in a prompt
pub fn estimate_turn(turn: &Turn) -> usize {
    estimate(&turn.text) + MESSAGE_OVERHEAD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate(""), 0);
        assert_eq!(estimate("abc"), 1);
        assert_eq!(estimate("abcd"), 1);
        assert_eq!(estimate("abcde"), 2);
    }

    #[test]
    fn test_estimate_counts_chars_not_bytes() {
        // 4 multi-byte characters
        assert_eq!(estimate("éééé"), 1);
    }

    #[test]
    fn test_message_overhead() {
        let messages = vec![Message::user("abcd"), Message::assistant("abcdefgh")];
        assert_eq!(estimate_messages(&messages), 1 + 4 + 2 + 4);
    }
}
