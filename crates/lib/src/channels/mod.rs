//! Chat channels (Telegram).
//!
//! The channel turns Bot API updates into [`Inbound`] events for the bot and exposes the
//! calls the bot needs to reply, edit prompts, and answer button presses.

mod inbound;
mod telegram;

pub use inbound::{BotCommand, Inbound, InboundCallback, InboundMessage};
pub use telegram::{
    escape_code, escape_markdown, InlineButton, TelegramChannel, TelegramError, TelegramUpdate,
};
