//! PACE - personality accentuating conversational engine
//!
//! Runs each user input through a fixed turn graph (recall, assemble,
//! generate, postprocess, persist) so replies stay in character and grounded
//! in long-term memory, whatever LLM backend is configured.

pub mod config;
pub mod context;
pub mod conversation;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod providers;
pub mod routes;

pub use engine::ConversationEngine;
