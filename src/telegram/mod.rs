// Telegram Bot API 客户端与 webhook 载荷类型

pub mod client;
pub mod types;

pub use client::{BotApi, TelegramClient, TelegramError};
pub use types::*;
