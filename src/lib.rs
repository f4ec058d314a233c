//! kovi-plugin-bili-search
//!
//! B 站视频搜索插件
//!
//! 指令流程: 搜索B站 关键词 → 视频 序号 → 序号 数字
//!
//! 搜索: 配置的触发词 + 关键词，列出编号结果
//! 播放: 播放前缀 + 视频编号，列出剧集
//! 选集: "序号 " + 剧集编号，发送播放链接 (文本或卡片)

// --- 类型定义 ---
mod types {
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Video {
        #[serde(default)]
        pub title: String,
        /// 获取剧集与播放地址用的句柄
        #[serde(default)]
        pub list_url: Option<String>,
        #[serde(default)]
        pub cover: Option<String>,
        #[serde(default)]
        pub description: Option<String>,
    }

    impl Video {
        pub fn handle(&self) -> Option<&str> {
            self.list_url.as_deref().filter(|h| !h.trim().is_empty())
        }

        pub fn is_feature_film(&self) -> bool {
            self.title.contains("剧场版")
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct SearchResult {
        pub ok: bool,
        pub videos: Vec<Video>,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct SearchSession {
        pub keyword: String,
        pub videos: Vec<Video>,
        pub page: u32,
    }

    impl SearchSession {
        pub fn new(keyword: &str, videos: Vec<Video>) -> Self {
            Self {
                keyword: keyword.to_string(),
                videos,
                page: 1,
            }
        }
    }

    /// 单个会话 (群或私聊) 的全部状态
    #[derive(Debug, Clone, Default)]
    pub struct ChatState {
        pub search: Option<SearchSession>,
        /// 视频编号 (从 1 开始) → 剧集标题
        pub episodes: HashMap<usize, Vec<String>>,
        pub selection: Option<usize>,
        pub last_active: i64,
    }

    impl ChatState {
        pub fn touch(&mut self) {
            self.last_active = chrono::Local::now().timestamp();
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct LinkCard {
        pub title: String,
        pub description: String,
        pub url: String,
        pub thumbnail: Option<String>,
    }
}

// --- 配置 ---
mod config {
    use kovi::utils::{load_toml_data, save_toml_data};
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;

    /// 选集结果的发送方式
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Delivery {
        #[default]
        Text,
        Card,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        #[serde(alias = "enable")]
        pub enabled: bool,
        /// 搜索触发词
        pub commands: Vec<String>,
        pub play_command: String,
        pub api_url: String,
        pub timeout_secs: u64,
        pub delivery: Delivery,
        /// 会话闲置多久后清理，0 表示不清理
        pub session_ttl_secs: u64,

        #[serde(skip)]
        pub(crate) path: PathBuf,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                enabled: true,
                commands: vec!["搜索B站".to_string()],
                play_command: "视频 ".to_string(),
                api_url: String::new(),
                timeout_secs: 10,
                delivery: Delivery::Text,
                session_ttl_secs: 0,
                path: PathBuf::new(),
            }
        }
    }

    impl Config {
        pub fn load(data_dir: PathBuf) -> Self {
            if !data_dir.exists()
                && let Err(e) = std::fs::create_dir_all(&data_dir)
            {
                kovi::log::error!("创建数据目录失败: {:?}", e);
            }
            let path = data_dir.join("config.toml");

            let mut config = match load_toml_data(Config::default(), path.clone()) {
                Ok(c) => {
                    kovi::log::info!("B站搜索插件配置加载成功: {:?}", path);
                    c
                }
                Err(e) => {
                    kovi::log::error!("加载配置失败: {:?}, 使用默认配置", e);
                    Config::default()
                }
            };
            config.path = path;
            config
        }

        pub fn save(&self) {
            if let Err(e) = save_toml_data(self, &self.path) {
                kovi::log::warn!("保存配置失败: {:?}", e);
            }
        }

        /// 按长度降序排列的触发词，避免短词抢先匹配
        pub fn search_triggers(&self) -> Vec<&str> {
            let mut v: Vec<&str> = self
                .commands
                .iter()
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .collect();
            v.sort_by_key(|c| std::cmp::Reverse(c.len()));
            v
        }
    }

}

// --- 工具函数 ---
mod utils {
    use super::types::{LinkCard, Video};

    const KEYCAPS: [&str; 10] = [
        "0️⃣", "1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣",
    ];

    pub const DIVIDER: &str = "_________________________";

    const WATCH_HINT: &str = "点开后用浏览器观看哦 🎥";

    /// 全角数字、全角空格转半角
    pub fn normalize(s: &str) -> String {
        s.chars()
            .map(|c| match c {
                '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
                '\u{3000}' => ' ',
                _ => c,
            })
            .collect()
    }

    /// 数字转 Emoji 序号，多位数逐位拼接 (10 → 1️⃣0️⃣)
    pub fn number_glyph(n: usize) -> String {
        n.to_string()
            .bytes()
            .map(|b| KEYCAPS[(b - b'0') as usize])
            .collect()
    }

    /// 把用户输入的 1 起始编号换成列表下标可用的编号，越界返回 None
    pub fn one_based(value: i64, len: usize) -> Option<usize> {
        usize::try_from(value)
            .ok()
            .filter(|&i| i >= 1 && i <= len)
    }

    pub fn format_search_results(videos: &[Video], play_command: &str) -> String {
        let mut text = String::from("🎬———B站视频———🎬\n");
        for (i, v) in videos.iter().enumerate() {
            let marker = if v.is_feature_film() { "🎞️" } else { "🎾" };
            text.push_str(&format!("{}. {}{}\n", number_glyph(i + 1), v.title, marker));
        }
        text.push_str(DIVIDER);
        text.push('\n');
        text.push_str(&format!("🎵输入 “{}+序号” 选择视频🎵", play_command.trim()));
        text
    }

    pub fn format_episode_menu(title: &str, episodes: &[String]) -> String {
        let mut text = format!("🎬———{} ———🎬\n", title);
        for (i, ep) in episodes.iter().enumerate() {
            text.push_str(&format!("{}. {}\n", number_glyph(i + 1), ep));
        }
        text.push_str(DIVIDER);
        text.push('\n');
        text.push_str("🎵输入 “序号 + 数字” 选择剧集🎵");
        text
    }

    fn episode_title(video: &Video, episode: &str) -> String {
        format!("🎉{} - {}🎉", video.title, episode)
    }

    pub fn format_episode_text(video: &Video, episode: &str, url: &str) -> String {
        format!("{}\n🔗 {}\n{}", episode_title(video, episode), url, WATCH_HINT)
    }

    pub fn build_card(video: &Video, episode: &str, url: &str) -> LinkCard {
        let mut description = format!("{}\n温馨提示：需要等待5秒再点击哦", WATCH_HINT);
        if let Some(d) = video.description.as_deref().filter(|d| !d.is_empty()) {
            description.push('\n');
            description.push_str(d);
        }
        LinkCard {
            title: episode_title(video, episode),
            description,
            url: url.to_string(),
            thumbnail: video.cover.clone().filter(|c| !c.is_empty()),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn video(title: &str) -> Video {
            Video {
                title: title.to_string(),
                list_url: Some("https://api.example.com/list/1".to_string()),
                cover: None,
                description: None,
            }
        }

        #[test]
        fn single_digits_use_distinct_glyphs() {
            let glyphs: Vec<String> = (1..=9).map(number_glyph).collect();
            let mut dedup = glyphs.clone();
            dedup.sort();
            dedup.dedup();
            assert_eq!(dedup.len(), 9);
            assert_eq!(glyphs[0], "1️⃣");
        }

        #[test]
        fn ten_is_one_then_zero() {
            assert_eq!(number_glyph(10), format!("{}{}", number_glyph(1), number_glyph(0)));
            assert_eq!(number_glyph(10), "1️⃣0️⃣");
        }

        #[test]
        fn one_based_rejects_out_of_range() {
            assert_eq!(one_based(1, 2), Some(1));
            assert_eq!(one_based(2, 2), Some(2));
            assert_eq!(one_based(0, 2), None);
            assert_eq!(one_based(3, 2), None);
            assert_eq!(one_based(-1, 2), None);
            assert_eq!(one_based(1, 0), None);
        }

        #[test]
        fn normalize_fullwidth() {
            assert_eq!(normalize("序号　１２"), "序号 12");
        }

        #[test]
        fn feature_films_get_their_own_marker() {
            let text = format_search_results(
                &[video("犬夜叉"), video("犬夜叉 剧场版 时代之爱")],
                "视频 ",
            );
            assert!(text.contains("1️⃣. 犬夜叉🎾"));
            assert!(text.contains("2️⃣. 犬夜叉 剧场版 时代之爱🎞️"));
            assert!(text.ends_with("🎵输入 “视频+序号” 选择视频🎵"));
        }

        #[test]
        fn card_skips_empty_cover_and_description() {
            let mut v = video("犬夜叉");
            v.cover = Some(String::new());
            v.description = Some("战国御伽草子".into());
            let card = build_card(&v, "第2集", "https://cdn.example.com/2.mp4");
            assert_eq!(card.title, "🎉犬夜叉 - 第2集🎉");
            assert_eq!(card.thumbnail, None);
            assert!(card.description.ends_with("\n战国御伽草子"));
            assert_eq!(card.url, "https://cdn.example.com/2.mp4");
        }
    }
}

// --- 指令解析器 ---
mod parser {
    use super::config::Config;
    use super::utils::normalize;
    use std::num::IntErrorKind;

    pub const EPISODE_PREFIXES: &[&str] = &["序号 ", "episode number "];

    #[derive(Debug, Clone, PartialEq)]
    pub enum Command {
        /// 视频编号，无法解析时为 None
        Play(Option<i64>),
        SelectEpisode(Option<i64>),
        Search(String),
    }

    fn parse_number(s: &str) -> Option<i64> {
        match s.split_whitespace().next()?.parse::<i64>() {
            Ok(n) => Some(n),
            // 溢出的纯数字仍算数字，交给后面的越界检查
            Err(e) => match e.kind() {
                IntErrorKind::PosOverflow => Some(i64::MAX),
                IntErrorKind::NegOverflow => Some(i64::MIN),
                _ => None,
            },
        }
    }

    /// 依次匹配 播放 → 选集 → 搜索，命中即返回
    pub fn classify(raw: &str, cfg: &Config) -> Option<Command> {
        let norm = normalize(raw.trim());

        if !cfg.play_command.is_empty()
            && let Some(rest) = norm.strip_prefix(cfg.play_command.as_str())
        {
            return Some(Command::Play(parse_number(rest)));
        }

        for prefix in EPISODE_PREFIXES {
            if let Some(rest) = norm.strip_prefix(prefix) {
                return Some(Command::SelectEpisode(parse_number(rest)));
            }
        }

        for trigger in cfg.search_triggers() {
            if let Some(rest) = norm.strip_prefix(trigger) {
                let keyword = rest.split_whitespace().collect::<Vec<_>>().join(" ");
                return Some(Command::Search(keyword));
            }
        }

        None
    }

}

// --- 视频接口 ---
mod api {
    use super::types::{SearchResult, Video};
    use anyhow::{Context, bail};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use kovi::serde_json::{self, Value};
    use std::time::Duration;

    #[async_trait]
    pub trait VideoSource: Send + Sync {
        async fn search(&self, keyword: &str) -> anyhow::Result<SearchResult>;
        /// 剧集标题，与 playback_urls 下标一一对应
        async fn episodes(&self, handle: &str) -> anyhow::Result<Vec<String>>;
        async fn playback_urls(&self, handle: &str) -> anyhow::Result<Vec<String>>;
    }

    pub struct HttpVideoSource {
        client: reqwest::Client,
        api_url: String,
    }

    impl HttpVideoSource {
        pub fn new(api_url: &str, timeout: Duration) -> anyhow::Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("创建 HTTP 客户端失败")?;
            Ok(Self {
                client,
                api_url: api_url.trim().to_string(),
            })
        }

        async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> anyhow::Result<Value> {
            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .with_context(|| format!("请求 {} 失败", url))?;

            let status = resp.status();
            if status != StatusCode::OK {
                bail!("请求 {} 失败，状态码: {}", url, status);
            }

            resp.json::<Value>()
                .await
                .with_context(|| format!("解析 {} 的响应失败", url))
        }
    }

    #[async_trait]
    impl VideoSource for HttpVideoSource {
        async fn search(&self, keyword: &str) -> anyhow::Result<SearchResult> {
            if self.api_url.is_empty() {
                bail!("API URL 未配置");
            }
            let body = self.get_json(&self.api_url, &[("msg", keyword)]).await?;
            Ok(parse_search(&body))
        }

        async fn episodes(&self, handle: &str) -> anyhow::Result<Vec<String>> {
            let body = self.get_json(handle, &[]).await?;
            parse_episodes(&body)
        }

        async fn playback_urls(&self, handle: &str) -> anyhow::Result<Vec<String>> {
            let body = self.get_json(handle, &[]).await?;
            parse_playback_urls(&body)
        }
    }

    fn status_ok(body: &Value) -> bool {
        match body.get("code") {
            Some(Value::Number(n)) => n.as_i64() == Some(200),
            Some(Value::String(s)) => s.trim() == "200",
            _ => false,
        }
    }

    /// 缺少 list_url 的条目只记警告，不影响整体结果
    pub fn parse_search(body: &Value) -> SearchResult {
        let items = match body.get("data").and_then(|d| d.as_array()) {
            Some(v) if status_ok(body) => v,
            _ => return SearchResult::default(),
        };

        let mut videos = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<Video>(item.clone()) {
                Ok(v) => {
                    if v.handle().is_none() {
                        kovi::log::warn!("接口返回结果缺少 list_url 字段: {}", item);
                    }
                    videos.push(v);
                }
                Err(e) => kovi::log::warn!("跳过无法解析的条目 {}: {}", item, e),
            }
        }

        SearchResult { ok: true, videos }
    }

    fn data_array(body: &Value) -> anyhow::Result<&Vec<Value>> {
        match body.get("data").and_then(|d| d.as_array()) {
            Some(v) => Ok(v),
            None => bail!("接口返回缺少 data 字段: {}", body),
        }
    }

    pub fn parse_episodes(body: &Value) -> anyhow::Result<Vec<String>> {
        let items = data_array(body)?;
        Ok((1..=items.len()).map(|i| format!("第{}集", i)).collect())
    }

    pub fn parse_playback_urls(body: &Value) -> anyhow::Result<Vec<String>> {
        let items = data_array(body)?;
        Ok(items
            .iter()
            .filter_map(|item| item.get("mp4").and_then(|u| u.as_str()))
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect())
    }

}

// --- 会话数据 ---
mod data {
    use super::types::{ChatState, SearchSession};
    use async_trait::async_trait;
    use kovi::tokio::sync::RwLock;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// 按会话 ID 存放搜索结果、剧集缓存与当前选择
    #[async_trait]
    pub trait SessionStore: Send + Sync {
        async fn search_session(&self, chat: &str) -> anyhow::Result<Option<SearchSession>>;
        /// 覆盖旧的搜索结果，剧集缓存与当前选择保持不变
        async fn save_search_session(&self, chat: &str, session: SearchSession)
        -> anyhow::Result<()>;
        async fn episodes(&self, chat: &str, video_index: usize)
        -> anyhow::Result<Option<Vec<String>>>;
        async fn save_episodes(
            &self,
            chat: &str,
            video_index: usize,
            episodes: Vec<String>,
        ) -> anyhow::Result<()>;
        async fn selection(&self, chat: &str) -> anyhow::Result<Option<usize>>;
        async fn select(&self, chat: &str, video_index: usize) -> anyhow::Result<()>;

        async fn touch(&self, _chat: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct InMemorySessionStore {
        chats: RwLock<HashMap<String, ChatState>>,
    }

    impl InMemorySessionStore {
        pub fn new() -> Self {
            Self::default()
        }

        async fn update<F>(&self, chat: &str, f: F)
        where
            F: FnOnce(&mut ChatState) + Send,
        {
            let mut chats = self.chats.write().await;
            let state = chats.entry(chat.to_string()).or_default();
            f(state);
            state.touch();
        }

        /// 清理 last_active 早于 cutoff 的会话，返回清理数量
        pub async fn evict_older_than(&self, cutoff: i64) -> usize {
            let mut chats = self.chats.write().await;
            let before = chats.len();
            chats.retain(|_, s| s.last_active >= cutoff);
            before - chats.len()
        }

        pub async fn evict_idle(&self, ttl_secs: u64) -> usize {
            let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
            let cutoff = chrono::Local::now().timestamp().saturating_sub(ttl);
            self.evict_older_than(cutoff).await
        }

        pub async fn len(&self) -> usize {
            self.chats.read().await.len()
        }
    }

    #[async_trait]
    impl SessionStore for InMemorySessionStore {
        async fn search_session(&self, chat: &str) -> anyhow::Result<Option<SearchSession>> {
            Ok(self
                .chats
                .read()
                .await
                .get(chat)
                .and_then(|s| s.search.clone()))
        }

        async fn save_search_session(
            &self,
            chat: &str,
            session: SearchSession,
        ) -> anyhow::Result<()> {
            self.update(chat, |s| s.search = Some(session)).await;
            Ok(())
        }

        async fn episodes(
            &self,
            chat: &str,
            video_index: usize,
        ) -> anyhow::Result<Option<Vec<String>>> {
            Ok(self
                .chats
                .read()
                .await
                .get(chat)
                .and_then(|s| s.episodes.get(&video_index).cloned()))
        }

        async fn save_episodes(
            &self,
            chat: &str,
            video_index: usize,
            episodes: Vec<String>,
        ) -> anyhow::Result<()> {
            self.update(chat, |s| {
                s.episodes.insert(video_index, episodes);
            })
            .await;
            Ok(())
        }

        async fn selection(&self, chat: &str) -> anyhow::Result<Option<usize>> {
            Ok(self.chats.read().await.get(chat).and_then(|s| s.selection))
        }

        async fn select(&self, chat: &str, video_index: usize) -> anyhow::Result<()> {
            self.update(chat, |s| s.selection = Some(video_index)).await;
            Ok(())
        }

        async fn touch(&self, chat: &str) -> anyhow::Result<()> {
            if let Some(s) = self.chats.write().await.get_mut(chat) {
                s.touch();
            }
            Ok(())
        }
    }

    /// 每分钟清理一次闲置会话
    pub fn spawn_evictor(
        store: Arc<InMemorySessionStore>,
        ttl_secs: u64,
    ) -> kovi::tokio::task::JoinHandle<()> {
        kovi::tokio::spawn(async move {
            let mut ticker = kovi::tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let n = store.evict_idle(ttl_secs).await;
                if n > 0 {
                    kovi::log::info!("已清理 {} 个闲置会话，剩余 {} 个", n, store.len().await);
                }
            }
        })
    }

}

// --- 业务逻辑 ---
mod logic {
    use super::api::VideoSource;
    use super::config::{Config, Delivery};
    use super::data::SessionStore;
    use super::parser::{self, Command};
    use super::types::{LinkCard, SearchSession};
    use super::utils::{
        build_card, format_episode_menu, format_episode_text, format_search_results, one_based,
    };
    use async_trait::async_trait;
    use kovi::bot::message::{Message, Segment};
    use kovi_plugin_expand_napcat::NapCatApi;
    use std::sync::Arc;

    /// 回复当前消息的发送端
    #[async_trait]
    pub trait Replier: Send + Sync {
        fn send_text(&self, text: &str);
        fn send_link_card(&self, card: &LinkCard);
        /// 耗时请求前给原消息一个表情回应
        async fn acknowledge(&self) {}
    }

    pub struct EventReplier {
        event: Arc<kovi::MsgEvent>,
        bot: Arc<kovi::RuntimeBot>,
    }

    impl EventReplier {
        pub fn new(event: Arc<kovi::MsgEvent>, bot: Arc<kovi::RuntimeBot>) -> Self {
            Self { event, bot }
        }
    }

    #[async_trait]
    impl Replier for EventReplier {
        fn send_text(&self, text: &str) {
            self.event.reply(
                Message::new()
                    .add_reply(self.event.message_id)
                    .add_text(text),
            );
        }

        fn send_link_card(&self, card: &LinkCard) {
            let mut data = kovi::serde_json::json!({
                "url": card.url,
                "title": card.title,
                "content": card.description,
            });
            if let Some(image) = &card.thumbnail {
                data["image"] = kovi::serde_json::Value::String(image.clone());
            }
            self.event
                .reply(Message::from(vec![Segment::new("share", data)]));
        }

        async fn acknowledge(&self) {
            if let Err(e) = self
                .bot
                .set_msg_emoji_like(self.event.message_id.into(), "124")
                .await
            {
                kovi::log::error!("点赞失败: {:?}", e);
            }
        }
    }

    /// 群聊按群号、私聊按 QQ 号区分会话
    pub fn chat_id(event: &kovi::MsgEvent) -> String {
        match event.group_id {
            Some(g) => format!("group:{}", g),
            None => format!("private:{}", event.user_id),
        }
    }

    pub struct Handler {
        config: Config,
        source: Arc<dyn VideoSource>,
        store: Arc<dyn SessionStore>,
    }

    impl Handler {
        pub fn new(
            config: Config,
            source: Arc<dyn VideoSource>,
            store: Arc<dyn SessionStore>,
        ) -> Self {
            Self {
                config,
                source,
                store,
            }
        }

        pub async fn dispatch(&self, chat: &str, raw: &str, out: &dyn Replier) {
            if !self.config.enabled {
                return;
            }
            let Some(cmd) = parser::classify(raw, &self.config) else {
                return;
            };

            if let Err(e) = self.store.touch(chat).await {
                kovi::log::warn!("[{}] 刷新会话时间失败: {:?}", chat, e);
            }

            let (name, result) = match cmd {
                Command::Play(index) => ("视频选择", self.play(chat, index, out).await),
                Command::SelectEpisode(n) => ("剧集选择", self.select_episode(chat, n, out).await),
                Command::Search(keyword) => ("视频搜索", self.search(chat, &keyword, out).await),
            };

            if let Err(e) = result {
                kovi::log::error!("[{}] 处理{}过程中发生异常: {:?}", chat, name, e);
                out.send_text(&format!("处理{}过程中发生异常: {}", name, e));
            }
        }

        async fn search(&self, chat: &str, keyword: &str, out: &dyn Replier) -> anyhow::Result<()> {
            if keyword.is_empty() {
                out.send_text("请输入要搜索的关键词。");
                return Ok(());
            }

            out.acknowledge().await;

            let result = match self.source.search(keyword).await {
                Ok(r) => r,
                Err(e) => {
                    kovi::log::error!("[{}] 搜索 {} 失败: {:?}", chat, keyword, e);
                    out.send_text("😢 搜索服务暂时不可用，请稍后再试。");
                    return Ok(());
                }
            };

            if !result.ok || result.videos.is_empty() {
                kovi::log::warn!("未找到关键词为 {} 的视频", keyword);
                out.send_text("未找到相关视频。");
                return Ok(());
            }

            let text = format_search_results(&result.videos, &self.config.play_command);
            self.store
                .save_search_session(chat, SearchSession::new(keyword, result.videos))
                .await?;
            out.send_text(&text);
            kovi::log::info!("[{}] 已发送 {} 的搜索结果", chat, keyword);
            Ok(())
        }

        async fn play(&self, chat: &str, index: Option<i64>, out: &dyn Replier) -> anyhow::Result<()> {
            let Some(index) = index else {
                out.send_text("请输入有效的数字编号。");
                return Ok(());
            };

            let Some(session) = self.store.search_session(chat).await? else {
                out.send_text("请先搜索视频。");
                return Ok(());
            };

            let Some(index) = one_based(index, session.videos.len()) else {
                out.send_text("无效的视频编号。");
                return Ok(());
            };
            let video = &session.videos[index - 1];

            let Some(handle) = video.handle() else {
                out.send_text("视频信息中缺少 list_url。");
                return Ok(());
            };

            let episodes = match self.store.episodes(chat, index).await? {
                Some(cached) => cached,
                None => {
                    let fetched = match self.source.episodes(handle).await {
                        Ok(v) => v,
                        Err(e) => {
                            kovi::log::warn!("获取剧集列表失败 {}: {:?}", handle, e);
                            Vec::new()
                        }
                    };
                    if fetched.is_empty() {
                        out.send_text("无法获取该视频的剧集信息。");
                        return Ok(());
                    }
                    self.store.save_episodes(chat, index, fetched.clone()).await?;
                    fetched
                }
            };

            self.store.select(chat, index).await?;
            out.send_text(&format_episode_menu(&video.title, &episodes));
            Ok(())
        }

        async fn select_episode(
            &self,
            chat: &str,
            number: Option<i64>,
            out: &dyn Replier,
        ) -> anyhow::Result<()> {
            let Some(video_index) = self.store.selection(chat).await? else {
                out.send_text("请先选择视频。");
                return Ok(());
            };

            let Some(number) = number else {
                out.send_text("请输入有效的剧集数字编号。");
                return Ok(());
            };

            let session = self.store.search_session(chat).await?;
            let episodes = self.store.episodes(chat, video_index).await?;
            // 新的搜索结果可能比旧的短，当前选择不一定还指向有效视频
            let video = session
                .as_ref()
                .and_then(|s| s.videos.get(video_index.checked_sub(1)?));
            let (Some(video), Some(episodes)) = (video, episodes) else {
                out.send_text("请先选择视频并查看剧集列表。");
                return Ok(());
            };

            let Some(ep) = one_based(number, episodes.len()) else {
                out.send_text("无效的剧集编号。");
                return Ok(());
            };

            let urls = match video.handle() {
                Some(handle) => match self.source.playback_urls(handle).await {
                    Ok(v) => v,
                    Err(e) => {
                        kovi::log::warn!("获取视频链接失败 {}: {:?}", handle, e);
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            let Some(url) = urls.get(ep - 1) else {
                out.send_text("无法获取该集视频链接或该视频没有播放资源。");
                return Ok(());
            };

            let episode = &episodes[ep - 1];
            match self.config.delivery {
                Delivery::Text => out.send_text(&format_episode_text(video, episode, url)),
                Delivery::Card => out.send_link_card(&build_card(video, episode, url)),
            }
            kovi::log::info!("[{}] 已发送 {} - {} 的播放链接", chat, video.title, episode);
            Ok(())
        }
    }

}

// --- 入口 ---
use kovi::PluginBuilder;
use std::sync::Arc;
use std::time::Duration;

#[kovi::plugin]
async fn main() {
    let bot = PluginBuilder::get_runtime_bot();
    let config = config::Config::load(bot.get_data_path());

    let source = match api::HttpVideoSource::new(
        &config.api_url,
        Duration::from_secs(config.timeout_secs),
    ) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            kovi::log::error!("B站搜索插件初始化失败: {:?}", e);
            return;
        }
    };
    if config.api_url.trim().is_empty() {
        kovi::log::warn!("API URL 未配置，搜索将无法使用");
    }

    let store = Arc::new(data::InMemorySessionStore::new());
    let evictor = Arc::new(
        (config.session_ttl_secs > 0)
            .then(|| data::spawn_evictor(store.clone(), config.session_ttl_secs)),
    );

    let handler = Arc::new(logic::Handler::new(config.clone(), source, store));
    kovi::log::info!(
        "B站搜索插件已加载，触发词: {:?}，播放指令: {:?}",
        config.commands,
        config.play_command
    );

    PluginBuilder::on_msg(move |event| {
        let handler = handler.clone();
        let bot = bot.clone();
        async move {
            let raw = match event.borrow_text() {
                Some(v) => v,
                None => return,
            };
            let chat = logic::chat_id(&event);
            let replier = logic::EventReplier::new(event.clone(), bot);
            handler.dispatch(&chat, raw, &replier).await;
        }
    });

    PluginBuilder::drop({
        move || {
            let config = config.clone();
            let evictor = evictor.clone();
            async move {
                if let Some(h) = evictor.as_ref() {
                    h.abort();
                }
                config.save();
                kovi::log::info!("B站搜索插件已关闭");
            }
        }
    });
}
