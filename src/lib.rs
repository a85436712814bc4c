use config::Config;
use redis::Client as RedisClient;
use sqlx::PgPool;
use std::sync::Arc;
use telegram::TelegramClient;

pub mod config;
pub mod middleware;
pub mod telegram;
pub mod utils;

pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub redis: Arc<RedisClient>,
    // 未配置 bot token 时为 None，webhook 仅确认收到并丢弃更新
    pub telegram: Option<Arc<TelegramClient>>,
}
