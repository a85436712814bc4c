use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::routes::user::{TelegramLink, User, UserStore};
use crate::telegram::BotApi;
use crate::utils::decode_verify_token;

// 三类拒绝共用同一条提示，不向外暴露具体失败原因
const MSG_INVALID_TOKEN: &str =
    "❌ Invalid or expired verification token. Please get a new link from the website.";
const MSG_VERIFIED: &str = "✅ Verification successful!\n\n\
    You can now return to the website and open your daily chest. Welcome aboard! 🎰";

/// 令牌校验的拒绝原因。对 Telegram 用户不可区分，仅用于日志与测试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    InvalidToken,
    StaleToken,
    UnknownUser,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::InvalidToken => write!(f, "invalid token"),
            VerifyError::StaleToken => write!(f, "stale auth epoch"),
            VerifyError::UnknownUser => write!(f, "unknown user"),
        }
    }
}

/// 一次 /start 处理的终态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Verified,
    NotAMember,
    Rejected(VerifyError),
    // 存储故障等内部错误：记日志、发通用提示、照常确认 webhook
    Failed,
}

#[derive(Debug, Clone)]
pub struct TelegramIdentity {
    pub telegram_user_id: i64,
    pub telegram_username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeeplinkResponse {
    pub link: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct VerifyStatusResponse {
    pub verified: bool,
    pub telegram_username: Option<String>,
    pub joined_ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct VerifyWaitParams {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ManualVerifyRequest {
    pub telegram_user_id: i64,
    pub telegram_username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ManualVerifyResponse {
    pub verified: bool,
}

fn join_channel_message(config: &Config) -> String {
    let handle = config
        .telegram_channel_handle
        .as_deref()
        .or(config.telegram_channel_id.as_deref())
        .unwrap_or("our channel");
    format!(
        "❌ Please join our channel first: {}\n\nThen click the verification link again.",
        handle
    )
}

// 通知尽力而为，投递失败只记日志，不改变流程结果
async fn notify<B: BotApi>(bot: &B, chat_id: i64, text: &str) {
    if let Err(e) = bot.send_message(chat_id, text).await {
        tracing::warn!("Failed to deliver telegram notification to {}: {}", chat_id, e);
    }
}

/// 纯状态迁移：(当前用户, 验证结果) -> 下一状态。
/// 同一身份重复应用返回 None，既不重写也不刷新 verified_at
pub fn apply_verification(
    user: &User,
    identity: &TelegramIdentity,
    joined_ok: bool,
    now: DateTime<Utc>,
) -> Option<TelegramLink> {
    let same_identity = user.telegram_user_id == Some(identity.telegram_user_id)
        && user.telegram_username == identity.telegram_username
        && user.telegram_joined_ok == joined_ok;
    if same_identity && user.verified_at.is_some() {
        return None;
    }

    // 换绑到不同账号算新的验证，verified_at 取当前时间；
    // 同账号补全资料则保留首次验证时间
    let verified_at = if user.telegram_user_id == Some(identity.telegram_user_id) {
        user.verified_at.unwrap_or(now)
    } else {
        now
    };

    Some(TelegramLink {
        telegram_user_id: identity.telegram_user_id,
        telegram_username: identity.telegram_username.clone(),
        joined_ok,
        verified_at,
    })
}

/// 成员资格门槛。未配置频道直接放行；
/// 平台查询失败时按 telegram_membership_fail_open 决定放行还是拦下
pub async fn membership_satisfied<B: BotApi>(
    bot: &B,
    config: &Config,
    telegram_user_id: i64,
) -> bool {
    let Some(channel) = config.telegram_channel_id.as_deref() else {
        return true;
    };

    match bot.is_member(channel, telegram_user_id).await {
        Ok(joined) => joined,
        Err(e) => {
            if config.telegram_membership_fail_open {
                tracing::warn!(
                    "Membership check unavailable for telegram user {}: {}; proceeding per fail-open policy",
                    telegram_user_id,
                    e
                );
                true
            } else {
                tracing::warn!(
                    "Membership check unavailable for telegram user {}: {}; failing closed",
                    telegram_user_id,
                    e
                );
                false
            }
        }
    }
}

/// 处理 `/start <token>`：校验令牌与纪元、过成员资格门槛、
/// 幂等提交绑定并通知用户。每个终态都会给用户发一条消息
pub async fn process_start_command<S, B>(
    store: &S,
    bot: &B,
    config: &Config,
    token: &str,
    from_id: i64,
    from_username: Option<&str>,
) -> StartOutcome
where
    S: UserStore,
    B: BotApi,
{
    let claims = match decode_verify_token(token, config) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!("Rejected verification token from telegram user {}: {}", from_id, e);
            notify(bot, from_id, MSG_INVALID_TOKEN).await;
            return StartOutcome::Rejected(VerifyError::InvalidToken);
        }
    };

    let user = match store.find_by_id(&claims.sub).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::warn!("Verification token references unknown user {}", claims.sub);
            notify(bot, from_id, MSG_INVALID_TOKEN).await;
            return StartOutcome::Rejected(VerifyError::UnknownUser);
        }
        Err(e) => {
            tracing::error!("Failed to load user {} during verification: {}", claims.sub, e);
            notify(bot, from_id, MSG_INVALID_TOKEN).await;
            return StartOutcome::Failed;
        }
    };

    // 纪元不匹配：密码重置等操作已把此前签发的链接整体作废
    if claims.v != user.auth_version {
        tracing::warn!(
            "Stale verification token for user {} (token epoch {}, current {})",
            user.user_id,
            claims.v,
            user.auth_version
        );
        notify(bot, from_id, MSG_INVALID_TOKEN).await;
        return StartOutcome::Rejected(VerifyError::StaleToken);
    }

    if !membership_satisfied(bot, config, from_id).await {
        notify(bot, from_id, &join_channel_message(config)).await;
        return StartOutcome::NotAMember;
    }

    let identity = TelegramIdentity {
        telegram_user_id: from_id,
        telegram_username: from_username.map(|s| s.to_string()),
    };

    if let Some(link) = apply_verification(&user, &identity, true, Utc::now()) {
        if let Err(e) = store.apply_telegram_link(&user.user_id, &link).await {
            tracing::error!("Failed to persist telegram link for {}: {}", user.user_id, e);
            notify(bot, from_id, MSG_INVALID_TOKEN).await;
            return StartOutcome::Failed;
        }
    }

    notify(bot, from_id, MSG_VERIFIED).await;
    tracing::info!("User {} verified via telegram user {}", user.user_id, from_id);
    StartOutcome::Verified
}

/// 回调查询必须先应答，否则客户端按钮一直转圈。
/// 载荷分派预留扩展位，目前只有占位的成员资格复查
pub async fn process_callback_query<B: BotApi>(
    bot: &B,
    callback_id: &str,
    from_id: i64,
    data: Option<&str>,
) {
    if let Err(e) = bot.answer_callback_query(callback_id).await {
        tracing::warn!(
            "Failed to answer callback query {} from telegram user {}: {}",
            callback_id,
            from_id,
            e
        );
    }

    match data {
        // 预留：通过内联按钮触发的成员资格复查
        Some("verify_membership") => {}
        _ => {}
    }
}

/// “订阅验证完成”接口：立即检查一次，之后按 poll_interval
/// 轮询存储，直到验证完成或超时。等价于客户端轮询的服务端实现
pub async fn wait_for_verification<S: UserStore>(
    store: &S,
    user_id: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<bool, sqlx::Error> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(user) = store.find_by_id(user_id).await? {
            if user.is_verified() {
                return Ok(true);
            }
        }
        if tokio::time::Instant::now() + poll_interval > deadline {
            return Ok(false);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::TelegramError;
    use crate::utils::generate_verify_token;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct InMemoryStore {
        users: Mutex<HashMap<String, User>>,
    }

    impl InMemoryStore {
        fn with_user(user: User) -> Self {
            let mut users = HashMap::new();
            users.insert(user.user_id.clone(), user);
            Self {
                users: Mutex::new(users),
            }
        }

        fn get(&self, user_id: &str) -> User {
            self.users.lock().unwrap().get(user_id).unwrap().clone()
        }

        fn update<F: FnOnce(&mut User)>(&self, user_id: &str, f: F) {
            let mut users = self.users.lock().unwrap();
            f(users.get_mut(user_id).unwrap());
        }
    }

    #[async_trait]
    impl UserStore for InMemoryStore {
        async fn find_by_id(&self, user_id: &str) -> Result<Option<User>, sqlx::Error> {
            Ok(self.users.lock().unwrap().get(user_id).cloned())
        }

        async fn apply_telegram_link(
            &self,
            user_id: &str,
            link: &TelegramLink,
        ) -> Result<(), sqlx::Error> {
            let mut users = self.users.lock().unwrap();
            let user = users.get_mut(user_id).ok_or(sqlx::Error::RowNotFound)?;
            user.telegram_user_id = Some(link.telegram_user_id);
            user.telegram_username = link.telegram_username.clone();
            user.telegram_joined_ok = link.joined_ok;
            user.verified_at = Some(link.verified_at);
            Ok(())
        }
    }

    enum Membership {
        Member,
        NotMember,
        Unavailable,
    }

    struct StubBot {
        sent: Mutex<Vec<(i64, String)>>,
        answered: Mutex<Vec<String>>,
        membership: Membership,
        membership_calls: AtomicUsize,
    }

    impl StubBot {
        fn new(membership: Membership) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                answered: Mutex::new(Vec::new()),
                membership,
                membership_calls: AtomicUsize::new(0),
            }
        }

        fn sent_messages(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BotApi for StubBot {
        async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn answer_callback_query(&self, callback_id: &str) -> Result<(), TelegramError> {
            self.answered.lock().unwrap().push(callback_id.to_string());
            Ok(())
        }

        async fn is_member(&self, _channel: &str, _user_id: i64) -> Result<bool, TelegramError> {
            self.membership_calls.fetch_add(1, Ordering::SeqCst);
            match self.membership {
                Membership::Member => Ok(true),
                Membership::NotMember => Ok(false),
                Membership::Unavailable => {
                    Err(TelegramError::Api("chat not found".to_string()))
                }
            }
        }
    }

    fn test_config() -> Config {
        Config {
            database_url: "postgres://localhost/test".into(),
            redis_url: "redis://localhost".into(),
            jwt_secret: "telegram-flow-test-secret".into(),
            jwt_expiration_secs: 24 * 3600,
            verify_token_expiration_secs: 15 * 60,
            rate_limit_window_secs: 60,
            rate_limit_requests: 100,
            server_host: "127.0.0.1".into(),
            server_port: 3000,
            api_base_uri: "/api".into(),
            telegram_bot_token: Some("12345:token".into()),
            telegram_bot_username: Some("waitlist_bot".into()),
            telegram_channel_id: Some("@waitlist_channel".into()),
            telegram_channel_handle: Some("@waitlist_channel".into()),
            telegram_membership_fail_open: true,
        }
    }

    fn test_user(user_id: &str, auth_version: i32) -> User {
        User {
            user_id: user_id.to_string(),
            email: format!("{}@example.com", user_id),
            nickname: "tester".to_string(),
            password_hash: None,
            recovery_code: None,
            auth_version,
            telegram_user_id: None,
            telegram_username: None,
            telegram_joined_ok: false,
            verified_at: None,
            created_at: Utc::now(),
        }
    }

    fn tamper(token: &str) -> String {
        let mut tampered = token.to_string();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });
        tampered
    }

    #[tokio::test]
    async fn valid_start_command_links_user() {
        let config = test_config();
        let store = InMemoryStore::with_user(test_user("u1", 1));
        let bot = StubBot::new(Membership::Member);
        let token = generate_verify_token("u1", 1, &config).unwrap();

        let outcome =
            process_start_command(&store, &bot, &config, &token, 555, Some("alice")).await;

        assert_eq!(outcome, StartOutcome::Verified);
        let user = store.get("u1");
        assert_eq!(user.telegram_user_id, Some(555));
        assert_eq!(user.telegram_username.as_deref(), Some("alice"));
        assert!(user.telegram_joined_ok);
        assert!(user.verified_at.is_some());
        let sent = bot.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 555);
        assert!(sent[0].1.starts_with("✅"));
    }

    #[tokio::test]
    async fn stale_epoch_token_is_rejected_after_password_reset() {
        let config = test_config();
        let store = InMemoryStore::with_user(test_user("u1", 1));
        let bot = StubBot::new(Membership::Member);
        let token = generate_verify_token("u1", 1, &config).unwrap();

        // 令牌签发后用户重置了密码，纪元抬升到 2
        store.update("u1", |u| u.auth_version = 2);

        let outcome = process_start_command(&store, &bot, &config, &token, 555, None).await;

        assert_eq!(outcome, StartOutcome::Rejected(VerifyError::StaleToken));
        let user = store.get("u1");
        assert_eq!(user.telegram_user_id, None);
        assert!(user.verified_at.is_none());
        // 提示文案与无效令牌相同，不暴露失败原因
        assert_eq!(bot.sent_messages()[0].1, MSG_INVALID_TOKEN);
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let config = test_config();
        let store = InMemoryStore::with_user(test_user("u1", 1));
        let bot = StubBot::new(Membership::Member);
        let token = generate_verify_token("u1", 1, &config).unwrap();

        let outcome =
            process_start_command(&store, &bot, &config, &tamper(&token), 555, None).await;

        assert_eq!(outcome, StartOutcome::Rejected(VerifyError::InvalidToken));
        assert_eq!(store.get("u1").telegram_user_id, None);
    }

    #[tokio::test]
    async fn token_for_unknown_user_is_rejected() {
        let config = test_config();
        let store = InMemoryStore::with_user(test_user("u1", 1));
        let bot = StubBot::new(Membership::Member);
        let token = generate_verify_token("deleted-user", 1, &config).unwrap();

        let outcome = process_start_command(&store, &bot, &config, &token, 555, None).await;

        assert_eq!(outcome, StartOutcome::Rejected(VerifyError::UnknownUser));
        assert_eq!(bot.sent_messages()[0].1, MSG_INVALID_TOKEN);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let config = test_config();
        let store = InMemoryStore::with_user(test_user("u1", 1));
        let bot = StubBot::new(Membership::Member);
        let token = generate_verify_token("u1", 1, &config).unwrap();

        let first =
            process_start_command(&store, &bot, &config, &token, 555, Some("alice")).await;
        assert_eq!(first, StartOutcome::Verified);

        // 回拨首次验证时间，若重复投递重写了 verified_at 则必被察觉
        let original_verified_at = Utc::now() - chrono::Duration::hours(1);
        store.update("u1", |u| u.verified_at = Some(original_verified_at));

        let second =
            process_start_command(&store, &bot, &config, &token, 555, Some("alice")).await;
        assert_eq!(second, StartOutcome::Verified);

        let user = store.get("u1");
        assert_eq!(user.telegram_user_id, Some(555));
        assert!(user.telegram_joined_ok);
        assert_eq!(user.verified_at, Some(original_verified_at));
        // 重复的成功通知是可接受的副作用
        assert_eq!(bot.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn membership_check_is_skipped_without_configured_channel() {
        let mut config = test_config();
        config.telegram_channel_id = None;
        let store = InMemoryStore::with_user(test_user("u1", 1));
        let bot = StubBot::new(Membership::NotMember);
        let token = generate_verify_token("u1", 1, &config).unwrap();

        let outcome = process_start_command(&store, &bot, &config, &token, 555, None).await;

        assert_eq!(outcome, StartOutcome::Verified);
        assert_eq!(bot.membership_calls.load(Ordering::SeqCst), 0);
        assert!(store.get("u1").is_verified());
    }

    #[tokio::test]
    async fn membership_check_failure_fails_open_by_default() {
        let config = test_config();
        let store = InMemoryStore::with_user(test_user("u1", 1));
        let bot = StubBot::new(Membership::Unavailable);
        let token = generate_verify_token("u1", 1, &config).unwrap();

        let outcome = process_start_command(&store, &bot, &config, &token, 555, None).await;

        assert_eq!(outcome, StartOutcome::Verified);
        assert!(store.get("u1").is_verified());
    }

    #[tokio::test]
    async fn membership_check_failure_fails_closed_when_configured() {
        let mut config = test_config();
        config.telegram_membership_fail_open = false;
        let store = InMemoryStore::with_user(test_user("u1", 1));
        let bot = StubBot::new(Membership::Unavailable);
        let token = generate_verify_token("u1", 1, &config).unwrap();

        let outcome = process_start_command(&store, &bot, &config, &token, 555, None).await;

        assert_eq!(outcome, StartOutcome::NotAMember);
        assert!(!store.get("u1").is_verified());
    }

    #[tokio::test]
    async fn non_member_gets_join_prompt_and_no_state_change() {
        let config = test_config();
        let store = InMemoryStore::with_user(test_user("u1", 1));
        let bot = StubBot::new(Membership::NotMember);
        let token = generate_verify_token("u1", 1, &config).unwrap();

        let outcome = process_start_command(&store, &bot, &config, &token, 555, None).await;

        assert_eq!(outcome, StartOutcome::NotAMember);
        let user = store.get("u1");
        assert_eq!(user.telegram_user_id, None);
        assert!(!user.telegram_joined_ok);
        let sent = bot.sent_messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("@waitlist_channel"));
    }

    #[tokio::test]
    async fn callback_query_is_always_answered() {
        let bot = StubBot::new(Membership::Member);

        process_callback_query(&bot, "cb-1", 555, Some("verify_membership")).await;
        process_callback_query(&bot, "cb-2", 555, None).await;

        let answered = bot.answered.lock().unwrap().clone();
        assert_eq!(answered, vec!["cb-1".to_string(), "cb-2".to_string()]);
        assert!(bot.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn status_query_observes_verification_within_one_poll() {
        let config = test_config();
        let store = InMemoryStore::with_user(test_user("u1", 1));
        let bot = StubBot::new(Membership::Member);
        let token = generate_verify_token("u1", 1, &config).unwrap();

        process_start_command(&store, &bot, &config, &token, 555, None).await;

        // 已验证用户在首次检查即返回，无需等满一个轮询周期
        let verified = wait_for_verification(
            &store,
            "u1",
            Duration::from_secs(2),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert!(verified);
    }

    #[tokio::test]
    async fn wait_for_verification_times_out_when_unverified() {
        let store = InMemoryStore::with_user(test_user("u1", 1));

        let verified = wait_for_verification(
            &store,
            "u1",
            Duration::from_millis(10),
            Duration::from_millis(35),
        )
        .await
        .unwrap();
        assert!(!verified);
    }

    #[test]
    fn apply_verification_is_a_no_op_for_identical_linkage() {
        let now = Utc::now();
        let mut user = test_user("u1", 1);
        let identity = TelegramIdentity {
            telegram_user_id: 555,
            telegram_username: Some("alice".to_string()),
        };

        let link = apply_verification(&user, &identity, true, now).unwrap();
        user.telegram_user_id = Some(link.telegram_user_id);
        user.telegram_username = link.telegram_username.clone();
        user.telegram_joined_ok = link.joined_ok;
        user.verified_at = Some(link.verified_at);

        assert!(apply_verification(&user, &identity, true, Utc::now()).is_none());
    }

    #[test]
    fn apply_verification_preserves_first_verified_at_for_same_account() {
        let first = Utc::now() - chrono::Duration::hours(2);
        let mut user = test_user("u1", 1);
        user.telegram_user_id = Some(555);
        user.telegram_username = None;
        user.telegram_joined_ok = true;
        user.verified_at = Some(first);

        // 同一账号补上了用户名，属于重复验证而非换绑
        let identity = TelegramIdentity {
            telegram_user_id: 555,
            telegram_username: Some("alice".to_string()),
        };
        let link = apply_verification(&user, &identity, true, Utc::now()).unwrap();
        assert_eq!(link.verified_at, first);
    }
}
