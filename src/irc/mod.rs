//! A small IRC server: wire messages, framing, configuration, naming rules,
//! and the event-loop core.

pub mod client;
pub mod codec;
mod commands;
pub mod config;
pub mod message;
pub mod names;
pub mod server;
