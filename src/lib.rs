//! Headless command palette core with an AI chat mode.
//!
//! The pieces, leaves first: a long-press-then-swipe-up `gesture` detector,
//! an on-screen keyboard `viewport` inset tracker, the bounded conversation
//! `history`, the mode/session `controller`, and the declarative `commands`
//! list projection. Platform signals reach the core through the traits in
//! `viewport` and `mobile`; chat models through `transport::ChatTransport`.

pub mod client;
pub mod commands;
pub mod config;
pub mod controller;
pub mod gesture;
pub mod history;
pub mod message;
pub mod mobile;
pub mod observer;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod viewport;

pub use commands::{CommandAction, CommandDefinition, CommandSource, FuzzyMatch, SkimFuzzy};
pub use controller::{ApprovalOutcome, Controller, KeyOutcome, PaletteKey, SendOutcome};
pub use gesture::{GestureConfig, GestureDetector, GestureHost};
pub use history::{Conversation, ConversationHistory};
pub use message::{ApprovalDecision, ChatStatus, Message, Mode, Role, ToolCall};
pub use transport::{ChatBackend, ChatEvent, ChatTransport};
