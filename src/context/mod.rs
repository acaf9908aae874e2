//! Prompt assembly
//!
//! [`assemble`] turns a persona, recalled memories, recent history and the
//! current input into the message list sent to the LLM. It is a pure
//! function: the same inputs always produce the same bundle.
//!
//! Layout:
//! 1. system: persona directives, traits and response style
//! 2. system: "Relevant Context from Past Conversations" (when any memory survives)
//! 3. history turns as user/assistant messages, oldest first
//! 4. user: the current input
//! 5. system: the response instruction
//!
//! When the estimate exceeds the budget, memories are dropped from the tail
//! (least relevant first), then history turns from the front (oldest first).
//! The persona block, the current input and the instruction always stay.

pub mod tokens;

use serde::Serialize;

use crate::config::PersonaProfile;
use crate::conversation::{Message, Turn};
use crate::memory::{MemoryRecord, RecordKind};

/// The prompt for one turn plus how it was trimmed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptBundle {
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    pub dropped_memories: usize,
    pub dropped_turns: usize,
    /// Still over budget after dropping everything droppable
    pub over_budget: bool,
}

pub fn assemble(
    persona: &PersonaProfile,
    memories: &[MemoryRecord],
    recent_turns: &[Turn],
    current_input: &str,
    token_budget: usize,
) -> PromptBundle {
    let mut kept_memories = memories.len();
    let mut first_turn = 0;

    loop {
        let messages = build(
            persona,
            &memories[..kept_memories],
            &recent_turns[first_turn..],
            current_input,
        );
        let estimated_tokens = tokens::estimate_messages(&messages);

        let fits = estimated_tokens <= token_budget;
        let exhausted = kept_memories == 0 && first_turn == recent_turns.len();
        if fits || exhausted {
            return PromptBundle {
                messages,
                estimated_tokens,
                dropped_memories: memories.len() - kept_memories,
                dropped_turns: first_turn,
                over_budget: !fits,
            };
        }

        if kept_memories > 0 {
            kept_memories -= 1;
        } else {
            first_turn += 1;
        }
    }
}

/// The memory block text, or `None` when there is nothing to show
pub fn memory_block(memories: &[MemoryRecord]) -> Option<String> {
    if memories.is_empty() {
        return None;
    }

    let mut lines = Vec::with_capacity(memories.len());
    let mut facts = 0;
    let mut relations = 0;
    for record in memories {
        match record.kind {
            RecordKind::Fact => {
                facts += 1;
                lines.push(format!("Relevant context {}: {}", facts, record.content));
            }
            RecordKind::Relation => {
                relations += 1;
                lines.push(format!("Related context {}: {}", relations, record.content));
            }
        }
    }

    Some(format!(
        "Relevant Context from Past Conversations:\n{}",
        lines.join("\n")
    ))
}

fn build(persona: &PersonaProfile, memories: &[MemoryRecord], turns: &[Turn], current_input: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(turns.len() + 4);

    messages.push(Message::system(persona.persona_block()));
    if let Some(block) = memory_block(memories) {
        messages.push(Message::system(block));
    }
    messages.extend(turns.iter().map(Turn::to_message));
    messages.push(Message::user(current_input));
    messages.push(Message::system(persona.response_instruction()));

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::persona_builtin;
    use crate::conversation::Role;

    fn memories() -> Vec<MemoryRecord> {
        vec![
            MemoryRecord::fact("m1", "User's name is Alex", Some(0.9)),
            MemoryRecord::fact("m2", "Alex likes green tea", Some(0.4)),
            MemoryRecord::relation("r1", "alex -- owns -- cat"),
        ]
    }

    fn history() -> Vec<Turn> {
        vec![
            Turn::user("Hi"),
            Turn::agent("Hello!"),
            Turn::user("How are you?"),
            Turn::agent("Great, thanks for asking!"),
        ]
    }

    #[test]
    fn test_layout() {
        let persona = persona_builtin::cheerful("Alex");
        let bundle = assemble(&persona, &memories(), &history()[..2], "What's my name?", 10_000);

        let roles: Vec<Role> = bundle.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::System, Role::User, Role::Assistant, Role::User, Role::System]
        );
        assert!(bundle.messages[0].content.starts_with("Core Persona Directives:"));
        assert_eq!(
            bundle.messages[1].content,
            "Relevant Context from Past Conversations:\n\
             Relevant context 1: User's name is Alex\n\
             Relevant context 2: Alex likes green tea\n\
             Related context 1: alex -- owns -- cat"
        );
        assert_eq!(bundle.messages[4].content, "What's my name?");
        assert!(bundle.messages[5].content.starts_with("Respond as Sunny"));
        assert_eq!(bundle.estimated_tokens, tokens::estimate_messages(&bundle.messages));
        assert!(!bundle.over_budget);
    }

    #[test]
    fn test_no_memory_block_without_memories() {
        let persona = persona_builtin::cheerful("Alex");
        let bundle = assemble(&persona, &[], &[], "Hi", 10_000);
        assert_eq!(bundle.messages.len(), 3);
    }

    #[test]
    fn test_deterministic() {
        let persona = persona_builtin::cheerful("Alex");
        let (memories, history) = (memories(), history());
        let a = assemble(&persona, &memories, &history, "What's my name?", 150);
        let b = assemble(&persona, &memories, &history, "What's my name?", 150);
        assert_eq!(a, b);
    }

    #[test]
    fn test_drops_memories_before_turns() {
        let persona = persona_builtin::cheerful("Alex");
        let history = history();
        let full = assemble(&persona, &memories(), &history, "What's my name?", usize::MAX);
        let without_memories = assemble(&persona, &[], &history, "What's my name?", usize::MAX);

        // Budget that fits everything except the memory block
        let bundle = assemble(
            &persona,
            &memories(),
            &history,
            "What's my name?",
            without_memories.estimated_tokens,
        );
        assert!(full.estimated_tokens > without_memories.estimated_tokens);
        assert_eq!(bundle.dropped_memories, 3);
        assert_eq!(bundle.dropped_turns, 0);
        assert!(!bundle.over_budget);
    }

    #[test]
    fn test_drops_least_relevant_memory_first() {
        let persona = persona_builtin::cheerful("Alex");
        let memories = memories();
        let two = assemble(&persona, &memories[..2], &[], "Hi", usize::MAX);

        let bundle = assemble(&persona, &memories, &[], "Hi", two.estimated_tokens);
        assert_eq!(bundle.dropped_memories, 1);
        assert!(!bundle.messages[1].content.contains("owns"));
        assert!(bundle.messages[1].content.contains("User's name is Alex"));
    }

    #[test]
    fn test_drops_oldest_turns_first() {
        let persona = persona_builtin::cheerful("Alex");
        let history = history();
        let last_two = assemble(&persona, &[], &history[2..], "What's my name?", usize::MAX);

        let bundle = assemble(&persona, &memories(), &history, "What's my name?", last_two.estimated_tokens);
        assert_eq!(bundle.dropped_memories, 3);
        assert_eq!(bundle.dropped_turns, 2);
        assert_eq!(bundle.messages[1].content, "How are you?");
        assert_eq!(bundle.messages[2].content, "Great, thanks for asking!");
    }

    #[test]
    fn test_current_input_survives_tiny_budget() {
        let persona = persona_builtin::cheerful("Alex");
        let bundle = assemble(&persona, &memories(), &history(), "What's my name?", 1);

        assert!(bundle.over_budget);
        assert_eq!(bundle.dropped_memories, 3);
        assert_eq!(bundle.dropped_turns, 4);
        assert_eq!(bundle.messages.len(), 3);
        assert_eq!(bundle.messages[1], Message::user("What's my name?"));
    }
}
