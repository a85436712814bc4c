use std::env;
use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub jwt_expiration_secs: u64,
    pub verify_token_expiration_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_requests: u32,
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_bot_username: Option<String>,
    pub telegram_channel_id: Option<String>,
    pub telegram_channel_handle: Option<String>,
    // 成员资格检查失败（平台错误/超时）时是否放行验证
    pub telegram_membership_fail_open: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenv::dotenv().ok();

        let jwt_expiration = env::var("JWT_EXPIRATION")?
            .trim_end_matches('h')
            .parse::<u64>()
            .unwrap_or(24);
        // 验证令牌以分钟计：够用户切换应用，但限制重放窗口
        let verify_token_expiration = env::var("VERIFY_TOKEN_EXPIRATION")
            .map(|v| v.trim_end_matches('m').parse::<u64>().unwrap_or(15))
            .unwrap_or(15);
        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL")?,
            server_host: env::var("SERVER_HOST")?,
            server_port: env::var("SERVER_PORT")?.parse().unwrap_or(3000),
            api_base_uri: env::var("API_BASE_URI").unwrap_or_else(|_| "/api".to_string()),
            jwt_secret: env::var("JWT_SECRET")?,
            jwt_expiration_secs: jwt_expiration * 3600,
            verify_token_expiration_secs: verify_token_expiration * 60,
            rate_limit_window_secs: env::var("RATE_LIMIT_WINDOW")?.parse().unwrap_or(60),
            rate_limit_requests: env::var("RATE_LIMIT_REQUESTS")?.parse().unwrap_or(100),
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_bot_username: env::var("TELEGRAM_BOT_USERNAME").ok(),
            telegram_channel_id: env::var("TELEGRAM_CHANNEL_ID").ok(),
            telegram_channel_handle: env::var("TELEGRAM_CHANNEL_HANDLE").ok(),
            telegram_membership_fail_open: env::var("TELEGRAM_MEMBERSHIP_FAIL_OPEN")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        })
    }

    pub fn jwt_expiration(&self) -> Duration {
        Duration::from_secs(self.jwt_expiration_secs)
    }

    pub fn verify_token_expiration(&self) -> Duration {
        Duration::from_secs(self.verify_token_expiration_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}
