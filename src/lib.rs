// lib.rs
//
// ================================================================================
// SakiSaki - 香草小祥小游戏
//
// 宿主层：Satori 风格的事件模型 | 适配器 / 插件接口 | 原子配置 | 事件循环
// 玩法层：见 `sakisaki` 模块
// ================================================================================


#[macro_use]
pub mod log;

pub mod sakisaki;
pub mod scheduler;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc};

// ============================================================================
// 1. Error Types (统一错误处理)
// ============================================================================

/// 宿主层错误类型
pub type BotError = Box<dyn std::error::Error + Send + Sync>;

pub type BotResult<T> = Result<T, BotError>;

// ============================================================================
// 2. Data Models (数据模型)
// ============================================================================

/// 用户对象
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct User {
    /// 用户 ID
    pub id: String,
    /// 用户名称
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 用户昵称（优先级高于 name）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    /// 是否为机器人
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_bot: Option<bool>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// 获取显示名称（优先 nick，其次 name，最后 id）
    pub fn display_name(&self) -> &str {
        self.nick
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.id)
    }
}

/// 频道对象
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Channel {
    /// 频道 ID
    pub id: String,
    /// 频道名称
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Channel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// 消息对象
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Message {
    /// 消息 ID
    pub id: String,
    /// 消息内容（消息元素编码）
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// 消息发送的时间戳（毫秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl Message {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            ..Default::default()
        }
    }
}

/// 登录状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LoginStatus {
    #[default]
    Offline,
    Online,
}

/// 登录信息，标识事件来自哪个平台的哪个适配器
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Login {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default)]
    pub status: LoginStatus,
    /// 适配器 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
}

impl Login {
    pub fn new(platform: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            platform: Some(platform.into()),
            adapter: Some(adapter.into()),
            ..Default::default()
        }
    }
}

/// 事件类型常量
pub mod event_types {
    pub const MESSAGE_CREATED: &str = "message-created";

    pub const LOGIN_ADDED: &str = "login-added";
    pub const LOGIN_REMOVED: &str = "login-removed";
}

/// 核心事件结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 事件类型
    #[serde(rename = "type")]
    pub event_type: String,
    /// 事件时间戳（毫秒）
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<Login>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// 消息发送者 / 事件目标用户
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            event_type: String::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            login: None,
            channel: None,
            message: None,
            user: None,
        }
    }
}

impl Event {
    /// 创建消息创建事件，发送者与频道取自消息本身
    pub fn message_created(message: Message) -> Self {
        Self {
            event_type: event_types::MESSAGE_CREATED.to_string(),
            user: message.user.clone(),
            channel: message.channel.clone(),
            message: Some(message),
            ..Default::default()
        }
    }

    pub fn login_added(login: Login) -> Self {
        Self {
            event_type: event_types::LOGIN_ADDED.to_string(),
            login: Some(login),
            ..Default::default()
        }
    }

    pub fn login_removed(login: Login) -> Self {
        Self {
            event_type: event_types::LOGIN_REMOVED.to_string(),
            login: Some(login),
            ..Default::default()
        }
    }

    pub fn with_login(mut self, login: Login) -> Self {
        self.login = Some(login);
        self
    }

    /// 获取消息内容（如果是消息事件）
    pub fn content(&self) -> Option<&str> {
        self.message.as_ref().map(|m| m.content.as_str())
    }

    /// 获取发送者 ID
    pub fn sender_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// 获取发送者显示名称
    pub fn sender_name(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.display_name())
    }

    /// 发送者是否为机器人
    pub fn is_from_bot(&self) -> bool {
        self.user
            .as_ref()
            .and_then(|u| u.is_bot)
            .unwrap_or(false)
    }

    /// 获取频道 ID
    pub fn channel_id(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.id.as_str())
    }

    /// 获取适配器 ID
    pub fn adapter(&self) -> Option<&str> {
        self.login.as_ref().and_then(|l| l.adapter.as_deref())
    }
}

// ============================================================================
// 3. 消息元素解析与构建
// ============================================================================

pub mod message_elements {
    use quick_xml::events::{BytesStart, Event as XmlEvent};
    use quick_xml::reader::Reader;
    use std::collections::HashMap;
    use std::fmt;

    /// Satori 消息元素（本项目用到的子集）
    #[derive(Debug, Clone, PartialEq)]
    pub enum Element {
        /// 纯文本
        Text(String),
        /// 提及用户 <at>
        At {
            id: Option<String>,
            name: Option<String>,
            at_type: Option<String>,
        },
        /// 图片 <img>
        Image { src: String, title: Option<String> },
        /// 换行 <br>
        Break,
        /// 其它标签，保留属性与子元素
        Unknown {
            tag: String,
            attrs: HashMap<String, String>,
            children: Vec<Element>,
        },
    }

    impl fmt::Display for Element {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Element::Text(t) => write!(f, "{}", escape_xml(t)),
                Element::At { id, name, at_type } => {
                    write!(f, "<at")?;
                    if let Some(v) = id {
                        write!(f, " id=\"{}\"", escape_attr(v))?;
                    }
                    if let Some(v) = name {
                        write!(f, " name=\"{}\"", escape_attr(v))?;
                    }
                    if let Some(v) = at_type {
                        write!(f, " type=\"{}\"", escape_attr(v))?;
                    }
                    write!(f, "/>")
                }
                Element::Image { src, title } => {
                    write!(f, "<img src=\"{}\"", escape_attr(src))?;
                    if let Some(v) = title {
                        write!(f, " title=\"{}\"", escape_attr(v))?;
                    }
                    write!(f, "/>")
                }
                Element::Break => write!(f, "<br/>"),
                Element::Unknown {
                    tag,
                    attrs,
                    children,
                } => {
                    write!(f, "<{}", tag)?;
                    for (k, v) in attrs {
                        write!(f, " {}=\"{}\"", k, escape_attr(v))?;
                    }
                    if children.is_empty() {
                        write!(f, "/>")
                    } else {
                        write!(f, ">")?;
                        for c in children {
                            write!(f, "{}", c)?;
                        }
                        write!(f, "</{}>", tag)
                    }
                }
            }
        }
    }

    /// 解析消息内容为元素列表，遇到无法解析的片段时返回已解析部分
    pub fn parse(content: &str) -> Vec<Element> {
        // 消息片段可能没有根节点
        let wrapped = format!("<root>{}</root>", content);
        let mut reader = Reader::from_str(&wrapped);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<(String, HashMap<String, String>, Vec<Element>)> =
            vec![("__DOCUMENT_ROOT__".to_string(), HashMap::new(), Vec::new())];
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(XmlEvent::Start(e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    stack.push((tag, parse_attributes(&e), Vec::new()));
                }
                Ok(XmlEvent::End(_)) => {
                    if stack.len() <= 1 {
                        break;
                    }
                    let Some((tag, attrs, children)) = stack.pop() else {
                        break;
                    };
                    let stack_len = stack.len();
                    let Some(parent) = stack.last_mut() else {
                        break;
                    };
                    if tag == "root" && stack_len == 1 {
                        parent.2.extend(children);
                    } else {
                        parent.2.push(build_element(&tag, attrs, children));
                    }
                }
                Ok(XmlEvent::Empty(e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    let element = build_element(&tag, parse_attributes(&e), Vec::new());
                    if let Some(parent) = stack.last_mut() {
                        parent.2.push(element);
                    }
                }
                Ok(XmlEvent::Text(e)) => {
                    if let Ok(text) = e.unescape()
                        && !text.is_empty()
                        && let Some(parent) = stack.last_mut()
                    {
                        push_text(&mut parent.2, &text);
                    }
                }
                Ok(XmlEvent::CData(e)) => {
                    let text = String::from_utf8_lossy(&e).to_string();
                    if let Some(parent) = stack.last_mut() {
                        push_text(&mut parent.2, &text);
                    }
                }
                Ok(XmlEvent::Eof) | Err(_) => break,
                _ => {}
            }
            buf.clear();
        }

        stack
            .into_iter()
            .next()
            .map(|(_, _, children)| children)
            .unwrap_or_default()
    }

    /// 相邻文本合并为一个节点
    fn push_text(children: &mut Vec<Element>, text: &str) {
        if let Some(Element::Text(last)) = children.last_mut() {
            last.push_str(text);
        } else {
            children.push(Element::Text(text.to_string()));
        }
    }

    fn parse_attributes(e: &BytesStart) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        for attr in e.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let value = attr
                .unescape_value()
                .map(|v| v.to_string())
                .unwrap_or_default();
            attrs.insert(key, value);
        }
        attrs
    }

    fn build_element(
        tag: &str,
        mut attrs: HashMap<String, String>,
        children: Vec<Element>,
    ) -> Element {
        match tag {
            "at" => Element::At {
                id: attrs.remove("id"),
                name: attrs.remove("name"),
                at_type: attrs.remove("type"),
            },
            "img" => Element::Image {
                src: attrs.remove("src").unwrap_or_default(),
                title: attrs.remove("title"),
            },
            "br" => Element::Break,
            _ => Element::Unknown {
                tag: tag.to_string(),
                attrs,
                children,
            },
        }
    }

    /// 转为可读的纯文本，<at> 显示为 @名称，图片显示为占位符
    pub fn to_plain_text(elements: &[Element]) -> String {
        let mut result = String::new();
        for elem in elements {
            match elem {
                Element::Text(text) => result.push_str(text),
                Element::At { id, name, at_type } => {
                    result.push('@');
                    match at_type.as_deref() {
                        Some("all") => result.push_str("全体成员"),
                        Some("here") => result.push_str("在线成员"),
                        _ => result.push_str(name.as_deref().or(id.as_deref()).unwrap_or("someone")),
                    }
                }
                Element::Image { title, .. } => {
                    result.push_str(title.as_deref().unwrap_or("[图片]"));
                }
                Element::Break => result.push('\n'),
                Element::Unknown { children, .. } => result.push_str(&to_plain_text(children)),
            }
        }
        result
    }

    /// 只取用户实际输入的文字，忽略提及、图片等元素
    pub fn text_content(elements: &[Element]) -> String {
        let mut result = String::new();
        for elem in elements {
            match elem {
                Element::Text(text) => result.push_str(text),
                Element::Break => result.push('\n'),
                Element::Unknown { children, .. } => result.push_str(&text_content(children)),
                Element::At { .. } | Element::Image { .. } => {}
            }
        }
        result
    }

    /// 构建消息元素（用于发送），生成 Satori 风格的 XML 片段
    pub struct MessageBuilder {
        elements: Vec<Element>,
    }

    impl MessageBuilder {
        pub fn new() -> Self {
            Self {
                elements: Vec::new(),
            }
        }

        /// 添加纯文本
        pub fn text(mut self, text: impl AsRef<str>) -> Self {
            push_text(&mut self.elements, text.as_ref());
            self
        }

        /// 添加图片
        pub fn image(mut self, src: impl AsRef<str>) -> Self {
            self.elements.push(Element::Image {
                src: src.as_ref().to_string(),
                title: None,
            });
            self
        }

        /// 添加换行
        pub fn br(mut self) -> Self {
            self.elements.push(Element::Break);
            self
        }

        pub fn build(self) -> String {
            self.elements.iter().map(|e| e.to_string()).collect()
        }
    }

    impl Default for MessageBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    fn escape_xml(text: &str) -> String {
        text.replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
    }

    fn escape_attr(text: &str) -> String {
        escape_xml(text)
            .replace('"', "&quot;")
            .replace('\'', "&apos;")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_builder_output_parses_back() {
            let msg = MessageBuilder::new()
                .text("a < b & c")
                .br()
                .image("file:///tmp/x.jpg")
                .build();
            assert_eq!(msg, r#"a &lt; b &amp; c<br/><img src="file:///tmp/x.jpg"/>"#);

            let elements = parse(&msg);
            assert_eq!(
                elements,
                vec![
                    Element::Text("a < b & c".to_string()),
                    Element::Break,
                    Element::Image {
                        src: "file:///tmp/x.jpg".to_string(),
                        title: None
                    },
                ]
            );
            assert_eq!(to_plain_text(&elements), "a < b & c\n[图片]");
        }

        #[test]
        fn test_at_is_rendered_but_not_counted_as_text() {
            let elements = parse(r#"<at id="42" name="Sakiko"/>早上好 <at type="all"/>"#);
            assert_eq!(to_plain_text(&elements), "@Sakiko早上好 @全体成员");
            assert_eq!(text_content(&elements), "早上好 ");
        }

        #[test]
        fn test_nested_unknown_tags_keep_their_text() {
            let elements = parse("<b>小<i>祥</i></b>!");
            assert_eq!(text_content(&elements), "小祥!");
            assert!(matches!(&elements[0], Element::Unknown { tag, .. } if tag == "b"));
        }

        #[test]
        fn test_plain_string_without_markup() {
            let elements = parse("saki");
            assert_eq!(elements, vec![Element::Text("saki".to_string())]);
        }
    }
}

// ============================================================================
// 4. 指令解析工具
// ============================================================================

pub mod command {
    /// 尝试匹配并剥离前缀
    ///
    /// 遍历 `prefixes` 列表，如果 `content` 以其中任意一个开头，则返回匹配到的前缀。
    pub fn match_prefix<'a>(content: &str, prefixes: &'a [String]) -> Option<&'a str> {
        let trimmed = content.trim_start();
        prefixes
            .iter()
            .find(|p| !p.is_empty() && trimmed.starts_with(p.as_str()))
            .map(|p| p.as_str())
    }

    /// 判断消息是否为指定指令，前缀可有可无
    pub fn is_command(content: &str, prefixes: &[String], name: &str) -> bool {
        let trimmed = content.trim();
        let body = match match_prefix(trimmed, prefixes) {
            Some(prefix) => &trimmed[prefix.len()..],
            None => trimmed,
        };
        !name.is_empty() && body.trim() == name
    }

}

// ============================================================================
// 5. Configuration System (配置系统)
// ============================================================================

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 核心配置
    #[serde(default)]
    pub core: CoreConfig,
    /// 插件配置（使用 flatten 支持任意插件配置）
    #[serde(flatten)]
    pub plugins: HashMap<String, toml::Value>,
}

/// 核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// 指令前缀
    #[serde(default = "default_cmd_prefix")]
    pub cmd_prefix: Vec<String>,
    /// 管理员用户列表
    #[serde(default)]
    pub admin_users: Vec<String>,
}

fn default_cmd_prefix() -> Vec<String> {
    vec!["/".to_string(), ".".to_string()]
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cmd_prefix: default_cmd_prefix(),
            admin_users: Vec::new(),
        }
    }
}

impl AppConfig {
    /// 获取指定插件的配置
    pub fn get_plugin_config<T: for<'de> Deserialize<'de>>(&self, plugin_id: &str) -> Option<T> {
        self.plugins
            .get(plugin_id)
            .and_then(|v| v.clone().try_into().ok())
    }

    /// 检查用户是否为管理员
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.core.admin_users.iter().any(|u| u == user_id)
    }
}

/// 配置管理器
pub struct ConfigManager {
    path: PathBuf,
    config: RwLock<AppConfig>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_config(path, AppConfig::default())
    }

    /// 使用给定的初始配置（不读盘）
    pub fn with_config<P: AsRef<Path>>(path: P, config: AppConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: RwLock::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载配置，如果文件不存在则创建默认配置
    pub async fn load(&self) -> BotResult<AppConfig> {
        if !self.path.exists() {
            let default_cfg = AppConfig::default();
            self.save_atomic(&default_cfg).await?;
            return Ok(default_cfg);
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let cfg: AppConfig = toml::from_str(&content)?;

        *self.config.write().await = cfg.clone();

        Ok(cfg)
    }

    /// 原子写入配置（写临时文件 -> Rename 覆盖）
    pub async fn save_atomic(&self, cfg: &AppConfig) -> BotResult<()> {
        let content = toml::to_string_pretty(cfg)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, content.as_bytes())).await??;

        *self.config.write().await = cfg.clone();

        Ok(())
    }

    /// 获取当前配置（只读快照）
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }
}

/// 写临时文件、落盘后 rename 覆盖目标文件，必要时创建父目录
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

// ============================================================================
// 6. Plugin Traits (插件接口定义)
// ============================================================================

/// 适配器接口，负责与平台通信
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// 获取 Any 引用，用于向下转型
    fn as_any(&self) -> &dyn Any;

    /// 适配器唯一标识
    fn id(&self) -> &str;

    /// 适配器名称
    fn name(&self) -> &str;

    /// 支持的平台列表
    fn platforms(&self) -> Vec<&str>;

    /// 启动适配器
    async fn start(&self, ctx: AdapterContext) -> BotResult<()>;

    /// 停止适配器
    async fn stop(&self) -> BotResult<()>;

    /// 发送消息，返回平台实际发出的消息（含消息 ID）
    async fn send_message(&self, channel_id: &str, content: &str) -> BotResult<Vec<Message>>;

    /// 撤回消息
    async fn delete_message(&self, _channel_id: &str, _message_id: &str) -> BotResult<()> {
        Err("API not implemented".into())
    }
}

/// 适配器上下文，传递给适配器的 start 方法
pub struct AdapterContext {
    /// 事件发送通道
    pub event_tx: mpsc::Sender<Event>,
    /// 配置管理器
    pub config: Arc<ConfigManager>,
    /// 系统信号订阅
    pub system_rx: broadcast::Receiver<SystemSignal>,
    /// 数据目录
    pub data_dir: PathBuf,
}

impl Clone for AdapterContext {
    fn clone(&self) -> Self {
        Self {
            event_tx: self.event_tx.clone(),
            config: self.config.clone(),
            system_rx: self.system_rx.resubscribe(),
            data_dir: self.data_dir.clone(),
        }
    }
}

/// 业务逻辑插件接口
#[async_trait]
pub trait Plugin: Send + Sync {
    /// 插件唯一标识，同时也是配置表名与数据目录名
    fn id(&self) -> &str;

    /// 插件名称
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn default_config(&self) -> Option<toml::Value> {
        None
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    /// 插件优先级（数字越小优先级越高）
    fn priority(&self) -> i32 {
        100
    }

    /// 插件加载时调用
    async fn on_load(&self, _ctx: &PluginContext) -> BotResult<()> {
        Ok(())
    }

    /// 插件卸载时调用
    async fn on_unload(&self, _ctx: &PluginContext) -> BotResult<()> {
        Ok(())
    }

    /// 接收事件
    async fn on_event(&self, ctx: &PluginContext, event: &Event) -> BotResult<EventResult>;
}

/// 事件处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventResult {
    /// 继续传递事件给后续插件
    #[default]
    Continue,
    /// 停止传递事件（事件已被处理）
    Stop,
}

/// 插件上下文
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<PluginContextInner>,
}

struct PluginContextInner {
    config: Arc<ConfigManager>,
    adapters: Arc<RwLock<HashMap<String, Arc<dyn Adapter>>>>,
    data_base_dir: PathBuf,
    plugin_id: String,
}

impl PluginContext {
    fn new(
        plugin_id: String,
        config: Arc<ConfigManager>,
        adapters: Arc<RwLock<HashMap<String, Arc<dyn Adapter>>>>,
        data_base_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(PluginContextInner {
                config,
                adapters,
                data_base_dir,
                plugin_id,
            }),
        }
    }

    /// 脱离事件循环构造上下文，供测试直接驱动插件
    #[cfg(test)]
    pub(crate) fn detached(
        plugin_id: &str,
        config: AppConfig,
        adapters: Vec<Arc<dyn Adapter>>,
        data_base_dir: PathBuf,
    ) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|a| (a.id().to_string(), a))
            .collect::<HashMap<_, _>>();
        Self::new(
            plugin_id.to_string(),
            Arc::new(ConfigManager::with_config(
                data_base_dir.join("config.toml"),
                config,
            )),
            Arc::new(RwLock::new(adapters)),
            data_base_dir,
        )
    }

    /// 获取配置
    pub async fn config(&self) -> AppConfig {
        self.inner.config.get().await
    }

    /// 获取当前插件的配置
    pub async fn plugin_config<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        self.config().await.get_plugin_config(&self.inner.plugin_id)
    }

    /// 获取当前插件的数据目录
    pub fn data_dir(&self) -> PathBuf {
        self.inner.data_base_dir.join(&self.inner.plugin_id)
    }

    /// 确保数据目录存在
    pub async fn ensure_data_dir(&self) -> BotResult<PathBuf> {
        let dir = self.data_dir();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// 获取适配器
    pub async fn get_adapter(&self, id: &str) -> Option<Arc<dyn Adapter>> {
        self.inner.adapters.read().await.get(id).cloned()
    }

    /// 通过事件快速回复消息
    pub async fn reply(&self, event: &Event, content: &str) -> BotResult<Vec<Message>> {
        let adapter_id = event
            .adapter()
            .ok_or_else(|| "Event has no adapter info".to_string())?;
        let channel_id = event
            .channel_id()
            .ok_or_else(|| "Event has no channel info".to_string())?;

        let adapter = self
            .get_adapter(adapter_id)
            .await
            .ok_or_else(|| format!("Adapter {} not found", adapter_id))?;
        adapter.send_message(channel_id, content).await
    }

    /// 检查用户是否为管理员
    pub async fn is_admin(&self, user_id: &str) -> bool {
        self.config().await.is_admin(user_id)
    }
}

// ============================================================================
// 7. System Signals (系统信号)
// ============================================================================

/// 框架广播给适配器的信号
#[derive(Clone, Debug)]
pub enum SystemSignal {
    Shutdown,
}

// ============================================================================
// 8. Framework Core (框架核心)
// ============================================================================

struct BotInner {
    config: Arc<ConfigManager>,
    adapters: Arc<RwLock<HashMap<String, Arc<dyn Adapter>>>>,
    plugins: Arc<Vec<Arc<dyn Plugin>>>,
    system_tx: broadcast::Sender<SystemSignal>,
    data_dir: PathBuf,
    event_tx: mpsc::Sender<Event>,
}

/// 框架构建器
pub struct BotBuilder {
    config_path: PathBuf,
    data_dir: PathBuf,
    adapters: Vec<Box<dyn Adapter>>,
    plugins: Vec<Box<dyn Plugin>>,
}

impl BotBuilder {
    pub fn new() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            data_dir: PathBuf::from("data"),
            adapters: Vec::new(),
            plugins: Vec::new(),
        }
    }

    /// 设置配置文件路径
    pub fn config_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = path.as_ref().to_path_buf();
        self
    }

    /// 设置数据目录
    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// 注册适配器
    pub fn adapter<A: Adapter + 'static>(mut self, adapter: A) -> Self {
        self.adapters.push(Box::new(adapter));
        self
    }

    /// 注册插件
    pub fn plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn build(self) -> Bot {
        Bot::from_builder(self)
    }
}

impl Default for BotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 框架核心
pub struct Bot {
    inner: Arc<BotInner>,
    event_rx: Option<mpsc::Receiver<Event>>,
}

impl Bot {
    pub fn builder() -> BotBuilder {
        BotBuilder::new()
    }

    fn from_builder(builder: BotBuilder) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1000);
        let (system_tx, _) = broadcast::channel(64);

        let adapters = builder
            .adapters
            .into_iter()
            .map(|a| (a.id().to_string(), Arc::from(a) as Arc<dyn Adapter>))
            .collect::<HashMap<_, _>>();

        let mut plugins: Vec<Arc<dyn Plugin>> =
            builder.plugins.into_iter().map(Arc::from).collect();
        plugins.sort_by_key(|p| p.priority());

        let inner = Arc::new(BotInner {
            config: Arc::new(ConfigManager::new(&builder.config_path)),
            adapters: Arc::new(RwLock::new(adapters)),
            plugins: Arc::new(plugins),
            system_tx,
            data_dir: builder.data_dir,
            event_tx,
        });

        Self {
            inner,
            event_rx: Some(event_rx),
        }
    }

    /// 启动框架，直到收到 Ctrl-C
    pub async fn run(mut self) -> BotResult<()> {
        // 1. 加载配置，并为缺少配置块的插件写入默认配置
        info!("正在加载配置: {}", self.inner.config.path().display());
        let mut initial_config = self.inner.config.load().await?;
        let mut config_modified = false;

        for plugin in self.inner.plugins.iter() {
            let pid = plugin.id();
            if !initial_config.plugins.contains_key(pid)
                && let Some(def_cfg) = plugin.default_config()
            {
                info!("  + 初始化插件配置: {}", plugin.name());
                initial_config.plugins.insert(pid.to_string(), def_cfg);
                config_modified = true;
            }
        }

        if config_modified {
            self.inner.config.save_atomic(&initial_config).await?;
        }

        // 2. 确保数据目录存在
        tokio::fs::create_dir_all(&self.inner.data_dir).await?;
        info!("数据目录: {}", self.inner.data_dir.display());

        // 3. 初始化插件
        for plugin in self.inner.plugins.iter() {
            let ctx = self.inner.create_plugin_context(plugin.id());
            match plugin.on_load(&ctx).await {
                Ok(()) => info!("  - {} v{} 已加载", plugin.name(), plugin.version()),
                Err(e) => error!("插件 {} 初始化失败: {}", plugin.name(), e),
            }
        }

        // 4. 启动适配器
        {
            let adapters = self.inner.adapters.read().await;
            for (id, adapter) in adapters.iter() {
                let ctx = AdapterContext {
                    event_tx: self.inner.event_tx.clone(),
                    config: self.inner.config.clone(),
                    system_rx: self.inner.system_tx.subscribe(),
                    data_dir: self.inner.data_dir.join(id),
                };
                let adapter = adapter.clone();
                let id = id.clone();

                tokio::spawn(async move {
                    if let Err(e) = adapter.start(ctx).await {
                        error!("适配器 {} 运行错误: {}", id, e);
                    }
                });
            }
        }

        // 5. 事件循环
        info!("事件循环已启动，等待消息...");
        let Some(mut event_rx) = self.event_rx.take() else {
            return Err("event loop already started".into());
        };

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        inner.process_event(event).await;
                    });
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("收到 Ctrl-C，正在停止...");
                    break;
                }
            }
        }

        self.shutdown().await;
        info!("框架已停止");
        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.inner.system_tx.send(SystemSignal::Shutdown);

        let adapters = self.inner.adapters.read().await;
        for (id, adapter) in adapters.iter() {
            if let Err(e) = adapter.stop().await {
                warn!("停止适配器 {} 时发生错误: {}", id, e);
            }
        }

        for plugin in self.inner.plugins.iter() {
            let ctx = self.inner.create_plugin_context(plugin.id());
            if let Err(e) = plugin.on_unload(&ctx).await {
                warn!("插件 {} 卸载失败: {}", plugin.name(), e);
            }
        }
    }
}

impl BotInner {
    async fn process_event(&self, event: Event) {
        for plugin in self.plugins.iter() {
            let ctx = self.create_plugin_context(plugin.id());
            match plugin.on_event(&ctx, &event).await {
                Ok(EventResult::Stop) => break,
                Ok(EventResult::Continue) => continue,
                Err(e) => {
                    error!("插件 {} 处理事件时发生错误: {}", plugin.name(), e);
                }
            }
        }
    }

    fn create_plugin_context(&self, plugin_id: &str) -> PluginContext {
        PluginContext::new(
            plugin_id.to_string(),
            self.config.clone(),
            self.adapters.clone(),
            self.data_dir.clone(),
        )
    }
}

// ============================================================================
// 9. Re-exports (重新导出)
// ============================================================================

pub mod prelude {
    //! 常用类型的预导入模块

    pub use super::{Bot, BotBuilder, BotError, BotResult};

    pub use super::{
        Adapter, AdapterContext, EventResult, Plugin, PluginContext, SystemSignal,
    };

    pub use super::{AppConfig, CoreConfig};

    pub use super::{Channel, Event, Login, LoginStatus, Message, User};

    pub use super::{command, event_types, message_elements};

    pub use super::message_elements::MessageBuilder;

    pub use async_trait::async_trait;

    pub use toml;
}
