//! External model service clients
//!
//! Thin request adapters over the four remote services the dialog pipeline
//! composes: speech recognition, intent classification, chat, and speech
//! synthesis. Each client variant is selected by name from configuration at
//! startup; a name the build does not know is a configuration error.

pub mod asr;
pub mod llm;
pub mod nlu;
pub mod tts;

pub use asr::AsrClient;
pub use llm::{ChatClient, QwenClient, TokenUsage};
pub use nlu::{intent, Intent, NluClient};
pub use tts::TtsClient;
