//! kovi-plugin-bilichat
//!
//! bilibili 链接解析插件
//!
//! 监听消息中的 b23 短链 / av / bv / cv / 动态链接, 通过 bilichat-request API
//! 识别内容并获取摘要图, 以 图片 + b23 链接 的形式回复
//!
//! 同一会话对同一内容有解析冷却, 冷却期内不重复解析
//!
//! 参数: --force | -f 强制解析 (跳过冷却检查, 但仍会重置冷却窗口)

// --- 类型定义 ---
mod types {
    use serde::{Deserialize, Deserializer, Serialize};

    fn default_true() -> bool {
        true
    }

    fn default_cd_time() -> u64 {
        120
    }

    fn default_quality() -> u8 {
        75
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Config {
        /// bilichat-request API 地址
        #[serde(default)]
        pub api_base: String,
        #[serde(default)]
        pub api_token: String,
        /// 同一会话同一内容的解析冷却时间(秒), 启动时读取一次
        #[serde(default = "default_cd_time")]
        pub cd_time: u64,
        /// 是否解析自身发送的消息
        #[serde(default)]
        pub enable_self: bool,
        /// 仅解析自身发送的消息
        #[serde(default)]
        pub only_self: bool,
        /// 仅在被 at 或私聊时解析
        #[serde(default)]
        pub only_to_me: bool,
        /// 图片数据无效时降级为纯文本回复
        #[serde(default = "default_true")]
        pub fallback: bool,
        #[serde(default = "default_true")]
        pub analyze_video: bool,
        #[serde(default = "default_true")]
        pub analyze_column: bool,
        #[serde(default = "default_true")]
        pub analyze_dynamic: bool,
        /// 摘要图渲染质量, 透传给 API
        #[serde(default = "default_quality")]
        pub browser_shot_quality: u8,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                api_base: String::new(),
                api_token: String::new(),
                cd_time: default_cd_time(),
                enable_self: false,
                only_self: false,
                only_to_me: false,
                fallback: true,
                analyze_video: true,
                analyze_column: true,
                analyze_dynamic: true,
                browser_shot_quality: default_quality(),
            }
        }
    }

    /// API 返回的 id 可能是数字也可能是字符串, 统一收成字符串
    fn de_id<'de, D>(d: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = serde_json::Value::deserialize(d)?;
        match v {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            other => Err(serde::de::Error::custom(format!("无效的内容 id: {other}"))),
        }
    }

    /// 链接识别结果
    #[derive(Debug, Clone, Deserialize)]
    pub struct Content {
        #[serde(rename = "type")]
        pub type_: String,
        #[serde(deserialize_with = "de_id")]
        pub id: String,
    }

    /// 单个内容的摘要, img 为 base64 编码的渲染图
    #[derive(Debug, Clone, Deserialize)]
    pub struct ContentDetail {
        pub img: String,
        pub b23: String,
    }
}

// --- 冷却门控 ---
mod cooldown {
    use std::collections::HashMap;
    use std::fmt;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use thiserror::Error;

    /// 请求方标识(会话维度)
    ///
    /// 与 [`ContentKey`] 刻意分成两个类型, 避免调用处把两个 id 传反
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct RequesterKey(String);

    impl RequesterKey {
        pub fn new(id: impl Into<String>) -> Self {
            Self(id.into())
        }
    }

    impl fmt::Display for RequesterKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /// 内容标识(归一化后的视频/专栏/动态 id)
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct ContentKey(String);

    impl ContentKey {
        pub fn new(id: impl Into<String>) -> Self {
            Self(id.into())
        }
    }

    impl fmt::Display for ContentKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    #[derive(Debug, Error)]
    pub enum CooldownError {
        /// 同一会话对同一内容仍在冷却窗口内, 属于正常分支而非异常
        #[error("冷却中, {} 秒后可再次解析", .retry_after.as_secs())]
        StillCoolingDown { retry_after: Duration },
    }

    /// (请求方, 内容) 维度的解析冷却
    ///
    /// 每个键对最多一条记录, 新的放行直接覆盖旧时间戳; 过期靠下次 check
    /// 时惰性判断, 不依赖后台定时清理
    ///
    /// 内部用一把锁保证同一键对的并发 check 串行化, 操作本身不挂起,
    /// 可以在外层异步锁内安全调用
    pub struct CooldownGate {
        window: Duration,
        records: Mutex<HashMap<(RequesterKey, ContentKey), Instant>>,
    }

    impl CooldownGate {
        pub fn new(window: Duration) -> Self {
            Self {
                window,
                records: Mutex::new(HashMap::new()),
            }
        }

        /// 冷却检查
        ///
        /// 无记录或窗口已过则放行, 并把该键对的时间戳刷新为当前时刻;
        /// 仍在窗口内则返回剩余时间
        pub fn check(
            &self,
            requester: &RequesterKey,
            content: &ContentKey,
        ) -> Result<(), CooldownError> {
            self.check_at(requester, content, Instant::now())
        }

        /// 强制记录: 无条件把时间戳刷新为当前时刻, 不看现有状态
        ///
        /// 供 --force 路径使用, 绕过检查但依然为后续普通检查重置窗口
        pub fn record(&self, requester: &RequesterKey, content: &ContentKey) {
            self.record_at(requester, content, Instant::now());
        }

        fn check_at(
            &self,
            requester: &RequesterKey,
            content: &ContentKey,
            now: Instant,
        ) -> Result<(), CooldownError> {
            // 锁中毒时取回内部数据继续使用, check/record 不会 panic
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let key = (requester.clone(), content.clone());
            if let Some(ts) = records.get(&key) {
                let elapsed = now.duration_since(*ts);
                // 恰好到达窗口边界视为已过期, 放行
                if elapsed < self.window {
                    return Err(CooldownError::StillCoolingDown {
                        retry_after: self.window - elapsed,
                    });
                }
            }
            records.insert(key, now);
            Ok(())
        }

        fn record_at(&self, requester: &RequesterKey, content: &ContentKey, now: Instant) {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.insert((requester.clone(), content.clone()), now);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const WINDOW: Duration = Duration::from_secs(60);

        fn gate() -> CooldownGate {
            CooldownGate::new(WINDOW)
        }

        fn keys() -> (RequesterKey, ContentKey) {
            (RequesterKey::new("u1"), ContentKey::new("v100"))
        }

        fn secs(s: u64) -> Duration {
            Duration::from_secs(s)
        }

        #[test]
        fn first_check_passes() {
            let g = gate();
            let (r, c) = keys();
            assert!(g.check_at(&r, &c, Instant::now()).is_ok());
        }

        #[test]
        fn recheck_within_window_denied_with_remaining() {
            let g = gate();
            let (r, c) = keys();
            let t0 = Instant::now();
            g.check_at(&r, &c, t0).unwrap();

            let err = g.check_at(&r, &c, t0 + secs(30)).unwrap_err();
            let CooldownError::StillCoolingDown { retry_after } = err;
            assert_eq!(retry_after, secs(30));
        }

        #[test]
        fn window_boundary_is_inclusive() {
            let g = gate();
            let (r, c) = keys();
            let t0 = Instant::now();
            g.check_at(&r, &c, t0).unwrap();

            // 正好 60 秒, 视为窗口已过
            assert!(g.check_at(&r, &c, t0 + WINDOW).is_ok());
        }

        #[test]
        fn passing_check_refreshes_window() {
            let g = gate();
            let (r, c) = keys();
            let t0 = Instant::now();
            g.check_at(&r, &c, t0).unwrap();
            g.check_at(&r, &c, t0 + secs(60)).unwrap();

            // 第二次放行后窗口从 t0+60 重新计算
            let err = g.check_at(&r, &c, t0 + secs(90)).unwrap_err();
            let CooldownError::StillCoolingDown { retry_after } = err;
            assert_eq!(retry_after, secs(30));
        }

        #[test]
        fn pairs_are_independent() {
            let g = gate();
            let t0 = Instant::now();
            let u1 = RequesterKey::new("u1");
            let u2 = RequesterKey::new("u2");
            let v100 = ContentKey::new("v100");
            let v200 = ContentKey::new("v200");

            g.check_at(&u1, &v100, t0).unwrap();

            // 其他键对不受影响
            assert!(g.check_at(&u1, &v200, t0).is_ok());
            assert!(g.check_at(&u2, &v100, t0).is_ok());
            assert!(g.check_at(&u1, &v100, t0 + secs(1)).is_err());
        }

        #[test]
        fn record_always_resets() {
            let g = gate();
            let (r, c) = keys();
            let t0 = Instant::now();

            g.record_at(&r, &c, t0);
            // 连续 record 只是把窗口推到最后一次
            g.record_at(&r, &c, t0 + secs(10));

            let err = g.check_at(&r, &c, t0 + secs(50)).unwrap_err();
            let CooldownError::StillCoolingDown { retry_after } = err;
            assert_eq!(retry_after, secs(20));

            // 窗口刚过期也能立刻重置
            g.record_at(&r, &c, t0 + secs(70));
            assert!(g.check_at(&r, &c, t0 + secs(80)).is_err());
            assert!(g.check_at(&r, &c, t0 + secs(130)).is_ok());
        }

        #[test]
        fn force_record_then_check_denied() {
            let g = gate();
            let (r, c) = keys();
            let t0 = Instant::now();

            // 强制路径: 绕过检查直接记录
            g.record_at(&r, &c, t0);

            let err = g.check_at(&r, &c, t0 + secs(10)).unwrap_err();
            let CooldownError::StillCoolingDown { retry_after } = err;
            assert_eq!(retry_after, secs(50));
        }

        #[test]
        fn scenario_sixty_second_window() {
            let g = gate();
            let t0 = Instant::now();
            let u1 = RequesterKey::new("u1");
            let v100 = ContentKey::new("v100");
            let v200 = ContentKey::new("v200");

            assert!(g.check_at(&u1, &v100, t0).is_ok());
            let err = g.check_at(&u1, &v100, t0 + secs(30)).unwrap_err();
            let CooldownError::StillCoolingDown { retry_after } = err;
            assert_eq!(retry_after, secs(30));
            assert!(g.check_at(&u1, &v100, t0 + secs(60)).is_ok());
            assert!(g.check_at(&u1, &v200, t0).is_ok());
        }

        #[test]
        fn concurrent_first_check_single_winner() {
            use std::sync::Arc;
            use std::thread;

            let g = Arc::new(gate());
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let g = g.clone();
                    thread::spawn(move || {
                        g.check(&RequesterKey::new("u1"), &ContentKey::new("v100"))
                            .is_ok()
                    })
                })
                .collect();

            let passed = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count();

            // 同一键对的并发首查只能有一个赢家
            assert_eq!(passed, 1);
        }
    }
}

// --- 工具函数 ---
mod utils {
    use regex::Regex;
    use std::sync::OnceLock;

    pub static RE_B23: OnceLock<Regex> = OnceLock::new();

    /// 链接特征片段, 命中任意一个即认为包含可解析的 bilibili 链接
    pub const LINK_KEYWORDS: &[&str] = &["av", "bv", "cv", "dynamic", "opus", "t.bilibili.com"];

    /// 从文本中提取 b23 短链
    pub fn extract_b23(text: &str) -> Option<&str> {
        let re = RE_B23
            .get_or_init(|| Regex::new(r"(?:https?://)?b23\.(?:tv|wtf)/[0-9A-Za-z]+").unwrap());
        re.find(text).map(|m| m.as_str())
    }

    /// 文本是否疑似包含 bilibili 链接
    pub fn has_bili_link(text: &str) -> bool {
        let lower = text.to_lowercase();
        LINK_KEYWORDS.iter().any(|kw| lower.contains(kw))
    }

    /// 取出消息中所有文本段与卡片(json)段的内容
    pub fn scan_texts(msg: &kovi::bot::message::Message) -> Vec<String> {
        msg.iter()
            .filter_map(|seg| match seg.type_.as_str() {
                "text" => seg
                    .data
                    .get("text")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                "json" => seg
                    .data
                    .get("data")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                _ => None,
            })
            .collect()
    }

    /// 消息是否指向机器人自身: 私聊恒为真, 群聊看是否 at 了自己
    pub fn is_to_me(event: &kovi::MsgEvent) -> bool {
        if event.group_id.is_none() {
            return true;
        }
        event.message.iter().any(|seg| {
            seg.type_ == "at"
                && seg
                    .data
                    .get("qq")
                    .map(|v| match v {
                        serde_json::Value::String(s) => *s == event.self_id.to_string(),
                        serde_json::Value::Number(n) => n.as_i64() == Some(event.self_id),
                        _ => false,
                    })
                    .unwrap_or(false)
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn extract_b23_finds_short_link() {
            assert_eq!(
                extract_b23("看看这个 https://b23.tv/abc123 不错"),
                Some("https://b23.tv/abc123")
            );
            assert_eq!(extract_b23("b23.wtf/XyZ09"), Some("b23.wtf/XyZ09"));
            assert_eq!(extract_b23("没有链接的普通消息"), None);
        }

        #[test]
        fn keyword_scan_matches_known_forms() {
            assert!(has_bili_link("https://www.bilibili.com/video/BV1xx411c7mD"));
            assert!(has_bili_link("AV170001"));
            assert!(has_bili_link("https://t.bilibili.com/123456789"));
            assert!(has_bili_link("https://www.bilibili.com/opus/9876"));
            assert!(!has_bili_link("今天天气不错"));
        }
    }
}

// --- 参数解析 ---
mod parser {
    /// 消息内联参数
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Options {
        /// 强制解析: 跳过冷却检查, 但仍然重置冷却窗口
        pub force: bool,
    }

    pub fn parse_options(text: &str) -> Options {
        let mut opts = Options::default();
        for token in text.split_whitespace() {
            match token {
                "--force" | "-f" => opts.force = true,
                _ => {}
            }
        }
        opts
    }

}

// --- 请求 API 客户端 ---
mod api {
    use super::types::{Content, ContentDetail};
    use serde::Deserialize;
    use serde::de::DeserializeOwned;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum ApiError {
        /// 未配置 API 地址
        #[error("无 API 可用")]
        Unavailable,
        /// 链接命中但内容无法解析, 静默跳过
        #[error("解析中止: {0}")]
        Abort(String),
        /// 远端返回的错误, 需要反馈给用户
        #[error("{kind}: {message}")]
        Request { kind: String, message: String },
    }

    impl From<reqwest::Error> for ApiError {
        fn from(e: reqwest::Error) -> Self {
            Self::Request {
                kind: "RequestError".to_string(),
                message: e.to_string(),
            }
        }
    }

    /// 错误响应体形如 {"type": "...", "message": "..."}
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(rename = "type")]
        type_: String,
        message: String,
    }

    /// bilichat-request 服务的客户端, 内容识别与渲染都在远端完成
    pub struct RequestApi {
        client: reqwest::Client,
        base: String,
        token: String,
    }

    impl RequestApi {
        pub fn new(base: &str, token: &str) -> Result<Self, ApiError> {
            if base.is_empty() {
                return Err(ApiError::Unavailable);
            }
            Ok(Self {
                client: reqwest::Client::new(),
                base: base.trim_end_matches('/').to_string(),
                token: token.to_string(),
            })
        }

        async fn get<T: DeserializeOwned>(
            &self,
            path: &str,
            query: &[(&str, &str)],
        ) -> Result<T, ApiError> {
            let mut req = self
                .client
                .get(format!("{}{}", self.base, path))
                .query(query);
            if !self.token.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", self.token));
            }
            let resp = req.send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                if let Ok(err) = serde_json::from_str::<ErrorBody>(&body) {
                    return Err(ApiError::Request {
                        kind: err.type_,
                        message: err.message,
                    });
                }
                return Err(ApiError::Request {
                    kind: format!("HTTP {}", status.as_u16()),
                    message: body,
                });
            }
            Ok(resp.json::<T>().await?)
        }

        /// 还原 b23 短链
        pub async fn tools_b23_extract(&self, url: &str) -> Result<String, ApiError> {
            self.get("/tools/b23_extract", &[("url", url)]).await
        }

        /// 识别链接对应的内容类型与 id
        pub async fn content_all(&self, bililink: &str) -> Result<Content, ApiError> {
            match self
                .get::<Content>("/content/all", &[("bililink", bililink)])
                .await
            {
                Err(ApiError::Request { kind, message }) if kind == "AbortError" => {
                    Err(ApiError::Abort(message))
                }
                other => other,
            }
        }

        pub async fn content_video(&self, id: &str, quality: u8) -> Result<ContentDetail, ApiError> {
            self.get(
                "/content/video",
                &[("video_id", id), ("quality", &quality.to_string())],
            )
            .await
        }

        pub async fn content_column(
            &self,
            id: &str,
            quality: u8,
        ) -> Result<ContentDetail, ApiError> {
            self.get(
                "/content/column",
                &[("cvid", id), ("quality", &quality.to_string())],
            )
            .await
        }

        pub async fn content_dynamic(
            &self,
            id: &str,
            quality: u8,
        ) -> Result<ContentDetail, ApiError> {
            self.get(
                "/content/dynamic",
                &[("dynamic_id", id), ("quality", &quality.to_string())],
            )
            .await
        }
    }
}

// --- 数据管理 ---
mod data {
    use super::api::{ApiError, RequestApi};
    use super::cooldown::CooldownGate;
    use super::types::Config;
    use kovi::tokio::sync::RwLock;
    use kovi::utils::{load_json_data, save_json_data};
    use std::path::PathBuf;
    use std::time::Duration;

    pub struct Manager {
        pub config: RwLock<Config>,
        /// 冷却状态归 Manager 持有, 所有消息任务共享同一个门控
        pub gate: CooldownGate,
        path: PathBuf,
    }

    impl Manager {
        pub fn new(dir: PathBuf) -> Self {
            let path = dir.join("config.json");
            let default = Config::default();
            let config = load_json_data(default.clone(), path.clone()).unwrap_or(default);
            let gate = CooldownGate::new(Duration::from_secs(config.cd_time));
            Self {
                config: RwLock::new(config),
                gate,
                path,
            }
        }

        pub fn save(&self, cfg: &Config) {
            let _ = save_json_data(cfg, &self.path);
        }

        pub async fn request_api(&self) -> Result<RequestApi, ApiError> {
            let c = self.config.read().await;
            RequestApi::new(&c.api_base, &c.api_token)
        }
    }
}

// --- 业务逻辑 ---
mod logic {
    use super::api::{ApiError, RequestApi};
    use super::cooldown::{ContentKey, RequesterKey};
    use super::data::Manager;
    use super::types::{Config, Content};
    use super::utils;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use kovi::bot::message::Message;
    use kovi::{MsgEvent, RuntimeBot};
    use std::sync::Arc;

    pub(crate) fn reply_text(event: &Arc<MsgEvent>, text: impl Into<String>) {
        event.reply(
            Message::new()
                .add_reply(event.message_id)
                .add_text(text.into()),
        );
    }

    /// 会话维度的请求方标识: 群聊按群号, 私聊按用户号
    fn requester_key(event: &Arc<MsgEvent>) -> RequesterKey {
        match event.group_id {
            Some(gid) => RequesterKey::new(format!("group_{gid}")),
            None => RequesterKey::new(format!("private_{}", event.user_id)),
        }
    }

    /// 自身消息与 only_to_me 的准入规则
    fn permission_allows(c: &Config, is_self: bool, to_me: bool) -> bool {
        if is_self {
            // 自身消息一旦放行, 不再受 only_to_me 约束
            return c.only_self || c.enable_self;
        }
        if c.only_self {
            return false;
        }
        if c.only_to_me && !to_me {
            return false;
        }
        true
    }

    async fn permission_check(event: &Arc<MsgEvent>, mgr: &Arc<Manager>) -> bool {
        let c = mgr.config.read().await;
        permission_allows(&c, event.user_id == event.self_id, utils::is_to_me(event))
    }

    /// 收集待扫描文本: 当前消息的文本/卡片段, 满足条件时追加被回复消息的内容
    async fn collect_texts(
        event: &Arc<MsgEvent>,
        mgr: &Arc<Manager>,
        bot: &Arc<RuntimeBot>,
    ) -> Vec<String> {
        let mut texts = utils::scan_texts(&event.message);

        // 自身消息(且开启)或被 at 时, 被回复的消息也加入扫描
        let include_reply = {
            let c = mgr.config.read().await;
            (c.enable_self && event.user_id == event.self_id) || utils::is_to_me(event)
        };

        if include_reply
            && let Some(reply) = event.message.iter().find(|s| s.type_ == "reply")
            && let Some(id) = reply.data.get("id").and_then(|v| v.as_str())
            && let Ok(id) = id.parse::<i32>()
            && let Ok(ret) = bot.get_msg(id).await
            && let Some(msg_data) = ret.data.get("message")
        {
            let reply_msg = Message::from_value(msg_data.clone()).unwrap_or_default();
            texts.extend(utils::scan_texts(&reply_msg));
        }

        texts
    }

    /// 在候选文本中定位 bilibili 链接, b23 短链先经 API 还原
    async fn find_bili_link(texts: &[String], api: &RequestApi) -> Option<String> {
        let mut link = None;
        for text in texts {
            if let Some(short) = utils::extract_b23(text) {
                match api.tools_b23_extract(short).await {
                    Ok(extracted) => link = Some(extracted),
                    Err(e) => kovi::log::error!("b23 短链还原失败: {e}"),
                }
            } else if utils::has_bili_link(text) {
                link = Some(text.clone());
            }
        }
        link
    }

    /// 单条消息的完整流程: 参数 → 权限 → 链接识别 → 冷却 → 内容获取 → 回复
    pub async fn handle_message(event: &Arc<MsgEvent>, mgr: &Arc<Manager>, bot: &Arc<RuntimeBot>) {
        let opts = super::parser::parse_options(event.borrow_text().unwrap_or(""));

        if !permission_check(event, mgr).await {
            return;
        }

        let api = match mgr.request_api().await {
            Ok(api) => api,
            Err(e) => {
                kovi::log::error!("{e}, 跳过解析");
                return;
            }
        };

        let texts = collect_texts(event, mgr, bot).await;
        let Some(link) = find_bili_link(&texts, &api).await else {
            return;
        };

        let content = match api.content_all(&link).await {
            Ok(c) => c,
            Err(ApiError::Abort(msg)) => {
                kovi::log::info!("{msg}");
                return;
            }
            Err(e) => {
                kovi::log::error!("内容识别失败: {e}");
                return;
            }
        };

        let requester = requester_key(event);
        let content_key = ContentKey::new(content.id.clone());
        if opts.force {
            // 强制解析先记录冷却再请求, 即使后续请求失败冷却也已消耗
            mgr.gate.record(&requester, &content_key);
        } else if let Err(e) = mgr.gate.check(&requester, &content_key) {
            kovi::log::info!("{requester} 对 {content_key} 的解析被冷却拦截");
            reply_text(event, e.to_string());
            return;
        }

        send_content(event, mgr, &api, &content).await;
    }

    async fn send_content(
        event: &Arc<MsgEvent>,
        mgr: &Arc<Manager>,
        api: &RequestApi,
        content: &Content,
    ) {
        let (quality, fallback, enabled) = {
            let c = mgr.config.read().await;
            let enabled = match content.type_.as_str() {
                "video" => c.analyze_video,
                "column" => c.analyze_column,
                "dynamic" => c.analyze_dynamic,
                _ => false,
            };
            (c.browser_shot_quality, c.fallback, enabled)
        };

        let detail = match content.type_.as_str() {
            "video" if enabled => api.content_video(&content.id, quality).await,
            "column" if enabled => api.content_column(&content.id, quality).await,
            "dynamic" if enabled => api.content_dynamic(&content.id, quality).await,
            "video" | "column" | "dynamic" => {
                kovi::log::info!("内容类型 {} 的解析未开启, 跳过", content.type_);
                return;
            }
            other => {
                kovi::log::error!("未知的内容类型: {other}");
                return;
            }
        };

        match detail {
            Ok(detail) => {
                let msg = Message::new().add_reply(event.message_id);
                // 先确认图片数据是合法 base64, 坏图直接降级
                match STANDARD.decode(detail.img.as_bytes()) {
                    Ok(raw) if !raw.is_empty() => {
                        kovi::log::info!(
                            "发送 {} {} 摘要图 ({} 字节)",
                            content.type_,
                            content.id,
                            raw.len()
                        );
                        event.reply(
                            msg.add_image(&format!("base64://{}", detail.img))
                                .add_text(&detail.b23),
                        );
                    }
                    _ => {
                        kovi::log::error!("摘要图数据无效: {} {}", content.type_, content.id);
                        if fallback {
                            event.reply(msg.add_text(&detail.b23));
                        }
                    }
                }
            }
            Err(ApiError::Abort(msg)) => kovi::log::info!("{msg}"),
            Err(e) => {
                kovi::log::error!("{e}");
                reply_text(event, e.to_string());
            }
        }
    }

}

// --- 入口 ---
use kovi::PluginBuilder;
use std::sync::Arc;

#[kovi::plugin]
async fn main() {
    let bot = PluginBuilder::get_runtime_bot();
    let mgr = Arc::new(data::Manager::new(bot.get_data_path()));

    // 单条消息的判定与请求流程整体串行
    // 冷却门控自身不挂起, 在这把锁内调用不会重入死锁
    let handle_lock = Arc::new(kovi::tokio::sync::Mutex::new(()));

    let mgr_clone = mgr.clone();
    PluginBuilder::on_msg(move |event| {
        let mgr = mgr_clone.clone();
        let bot = bot.clone();
        let lock = handle_lock.clone();
        async move {
            let _guard = lock.lock().await;
            logic::handle_message(&event, &mgr, &bot).await;
        }
    });

    let mgr_drop = mgr.clone();
    PluginBuilder::drop({
        move || {
            let mgr = mgr_drop.clone();
            async move {
                // 保存配置
                let c = mgr.config.read().await;
                mgr.save(&c);
            }
        }
    });
}
