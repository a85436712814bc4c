use serde::Deserialize;

/// `?start=` 载荷的长度上限，超出的令牌拒绝生成深链
pub const MAX_START_PAYLOAD: usize = 512;

#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub message: Option<TelegramMessage>,
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub from: Option<TelegramUser>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub data: Option<String>,
}

/// 边界处一次性解码出的事件，下游据此穷举分派
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    StartCommand {
        token: String,
        from_id: i64,
        from_username: Option<String>,
    },
    CallbackQuery {
        id: String,
        from_id: i64,
        data: Option<String>,
    },
    Ignored,
}

/// 把原始 webhook 请求体归类为事件。
/// 无法解析或与验证无关的载荷一律归为 Ignored，绝不报错
pub fn classify_update(body: &[u8]) -> WebhookEvent {
    let update: TelegramUpdate = match serde_json::from_slice(body) {
        Ok(update) => update,
        Err(_) => return WebhookEvent::Ignored,
    };

    if let Some(message) = update.message {
        if let (Some(text), Some(from)) = (message.text, message.from) {
            if let Some(token) = text.strip_prefix("/start ") {
                let token = token.trim();
                if !token.is_empty() {
                    return WebhookEvent::StartCommand {
                        token: token.to_string(),
                        from_id: from.id,
                        from_username: from.username,
                    };
                }
            }
        }
    }

    if let Some(query) = update.callback_query {
        return WebhookEvent::CallbackQuery {
            id: query.id,
            from_id: query.from.id,
            data: query.data,
        };
    }

    WebhookEvent::Ignored
}

/// 构造拉起 bot 会话并传递令牌的深链。
/// 空令牌或超长令牌返回 None
pub fn build_deep_link(bot_username: &str, token: &str) -> Option<String> {
    if token.is_empty() || token.len() > MAX_START_PAYLOAD {
        return None;
    }
    let bot = bot_username.trim_start_matches('@');
    if bot.is_empty() {
        return None;
    }
    Some(format!("https://t.me/{}?start={}", bot, token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_command_is_classified_with_token() {
        let body = serde_json::json!({
            "update_id": 10001,
            "message": {
                "from": { "id": 555, "username": "alice" },
                "text": "/start abc.def.ghi"
            }
        });
        let event = classify_update(body.to_string().as_bytes());
        assert_eq!(
            event,
            WebhookEvent::StartCommand {
                token: "abc.def.ghi".to_string(),
                from_id: 555,
                from_username: Some("alice".to_string()),
            }
        );
    }

    #[test]
    fn bare_start_without_payload_is_ignored() {
        let body = serde_json::json!({
            "message": { "from": { "id": 555 }, "text": "/start" }
        });
        assert_eq!(
            classify_update(body.to_string().as_bytes()),
            WebhookEvent::Ignored
        );
    }

    #[test]
    fn callback_query_is_classified() {
        let body = serde_json::json!({
            "callback_query": {
                "id": "cb-1",
                "from": { "id": 777 },
                "data": "verify_membership"
            }
        });
        assert_eq!(
            classify_update(body.to_string().as_bytes()),
            WebhookEvent::CallbackQuery {
                id: "cb-1".to_string(),
                from_id: 777,
                data: Some("verify_membership".to_string()),
            }
        );
    }

    #[test]
    fn unrelated_message_is_ignored() {
        let body = serde_json::json!({
            "message": { "from": { "id": 555 }, "text": "hello there" }
        });
        assert_eq!(
            classify_update(body.to_string().as_bytes()),
            WebhookEvent::Ignored
        );
    }

    #[test]
    fn malformed_body_is_ignored() {
        assert_eq!(classify_update(b"not json at all"), WebhookEvent::Ignored);
        assert_eq!(classify_update(b"{}"), WebhookEvent::Ignored);
    }

    #[test]
    fn deep_link_wraps_token_and_strips_at() {
        let link = build_deep_link("@waitlist_bot", "tok123").unwrap();
        assert_eq!(link, "https://t.me/waitlist_bot?start=tok123");
    }

    #[test]
    fn deep_link_rejects_empty_and_oversized_tokens() {
        assert!(build_deep_link("waitlist_bot", "").is_none());
        let oversized = "x".repeat(MAX_START_PAYLOAD + 1);
        assert!(build_deep_link("waitlist_bot", &oversized).is_none());
    }
}
