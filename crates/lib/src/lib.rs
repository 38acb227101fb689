//! rebullos core library: the confirmation-gated command engine (propose, approve,
//! stream output, follow the log) and the Telegram bot that drives it.

pub mod bot;
pub mod channels;
pub mod command;
pub mod config;
pub mod engine;
pub mod exec;
pub mod gate;
pub mod pending;
pub mod session;
pub mod tail;
