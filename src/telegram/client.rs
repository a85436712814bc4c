use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug)]
pub enum TelegramError {
    Http(reqwest::Error),
    Api(String),
}

impl std::fmt::Display for TelegramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TelegramError::Http(e) => write!(f, "telegram http error: {}", e),
            TelegramError::Api(msg) => write!(f, "telegram api error: {}", msg),
        }
    }
}

impl std::error::Error for TelegramError {}

impl From<reqwest::Error> for TelegramError {
    fn from(e: reqwest::Error) -> Self {
        TelegramError::Http(e)
    }
}

/// Bot API 响应信封
#[derive(Debug, Deserialize)]
struct TelegramApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
    is_member: Option<bool>,
}

/// 消息平台的出站调用接口，验证流程只依赖这三个能力
#[async_trait]
pub trait BotApi: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError>;
    async fn answer_callback_query(&self, callback_id: &str) -> Result<(), TelegramError>;
    async fn is_member(&self, channel: &str, user_id: i64) -> Result<bool, TelegramError>;
}

#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    bot_token: String,
}

impl TelegramClient {
    pub fn new(bot_token: String) -> Self {
        Self {
            client: Client::new(),
            bot_token,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &Value,
    ) -> Result<T, TelegramError> {
        let url = format!("https://api.telegram.org/bot{}/{}", self.bot_token, method);

        let response = self.client.post(url).json(payload).send().await?;
        // 出错时平台返回非2xx但仍带 {ok:false, description} 信封，
        // 所以先解信封再判断，而不是 error_for_status
        let body: TelegramApiResponse<T> = response.json().await?;

        if !body.ok {
            return Err(TelegramError::Api(
                body.description
                    .unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        body.result
            .ok_or_else(|| TelegramError::Api(format!("{} returned ok without result", method)))
    }
}

#[async_trait]
impl BotApi for TelegramClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let payload = serde_json::json!({ "chat_id": chat_id, "text": text });
        let _: Value = self.call("sendMessage", &payload).await?;
        Ok(())
    }

    async fn answer_callback_query(&self, callback_id: &str) -> Result<(), TelegramError> {
        let payload = serde_json::json!({ "callback_query_id": callback_id });
        // answerCallbackQuery 的 result 是布尔值
        let _: bool = self.call("answerCallbackQuery", &payload).await?;
        Ok(())
    }

    async fn is_member(&self, channel: &str, user_id: i64) -> Result<bool, TelegramError> {
        let payload = serde_json::json!({ "chat_id": channel, "user_id": user_id });
        let member: ChatMember = self.call("getChatMember", &payload).await?;

        let joined = match member.status.as_str() {
            "creator" | "administrator" | "member" => true,
            // 受限成员仍在群内，以 is_member 为准
            "restricted" => member.is_member.unwrap_or(false),
            _ => false,
        };
        Ok(joined)
    }
}
