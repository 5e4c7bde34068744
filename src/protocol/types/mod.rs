//! Built-in packet type implementations

pub mod chat;

pub use chat::ChatMessage;
