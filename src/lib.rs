// lib.rs
//
// ================================================================================
// Caidan Bot Core - 以图为菜，以名点菜
// Copyright (c) 2025-Present Caidan Team
//
// 架构：Satori 协议子集 | 插件化系统 | 静态编译 | 原子配置
// ================================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc};

// ============================================================================
// 1. Error Types (统一错误处理)
// ============================================================================

/// 框架核心错误类型
pub type BotError = Box<dyn std::error::Error + Send + Sync>;

pub type BotResult<T> = Result<T, BotError>;

// ============================================================================
// 2. Satori Protocol Data Models (协议子集)
// 仅保留消息收发所需的资源类型
// ============================================================================

// ----------------------------------------------------------------------------
// 2.1 用户 (User)
// ----------------------------------------------------------------------------

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

// ----------------------------------------------------------------------------
// 2.2 群组 (Guild)
// ----------------------------------------------------------------------------

/// 群组对象
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Guild {
    /// 群组 ID
    pub id: String,
    /// 群组名称
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Guild {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

// ----------------------------------------------------------------------------
// 2.3 频道 (Channel)
// ----------------------------------------------------------------------------

/// 频道类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum ChannelType {
    /// 文本频道
    #[default]
    #[serde(rename = "0")]
    Text = 0,
    /// 私聊频道
    #[serde(rename = "1")]
    Direct = 1,
}

/// 频道对象
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Channel {
    /// 频道 ID
    pub id: String,
    /// 频道类型
    #[serde(rename = "type", default)]
    pub channel_type: ChannelType,
    /// 频道名称
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Channel {
    pub fn new(id: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            id: id.into(),
            channel_type,
            ..Default::default()
        }
    }

    /// 是否为私聊频道
    pub fn is_direct(&self) -> bool {
        self.channel_type == ChannelType::Direct
    }
}

// ----------------------------------------------------------------------------
// 2.4 消息 (Message)
// ----------------------------------------------------------------------------

/// 消息对象
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Message {
    /// 消息 ID
    pub id: String,
    /// 消息内容（使用 Satori 消息元素编码）
    pub content: String,
    /// 频道对象
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    /// 群组对象
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild: Option<Guild>,
    /// 用户对象
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

    /// 获取发送者 ID
    pub fn sender_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// 获取频道 ID
    pub fn channel_id(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.id.as_str())
    }
}

// ----------------------------------------------------------------------------
// 2.5 登录信息 (Login)
// ----------------------------------------------------------------------------

/// 登录状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum LoginStatus {
    /// 离线
    #[default]
    #[serde(rename = "0")]
    Offline = 0,
    /// 在线
    #[serde(rename = "1")]
    Online = 1,
}

/// 登录信息对象
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Login {
    /// 平台名称
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// 用户对象
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// 登录状态
    #[serde(default)]
    pub status: LoginStatus,
    /// 适配器名称
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
}

impl Login {
    pub fn new(platform: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            platform: Some(platform.into()),
            adapter: Some(adapter.into()),
            status: LoginStatus::Offline,
            ..Default::default()
        }
    }
}

// ----------------------------------------------------------------------------
// 2.6 事件 (Event)
// ----------------------------------------------------------------------------

/// 事件类型常量
pub mod event_types {
    // 消息事件
    pub const MESSAGE_CREATED: &str = "message-created";
    pub const MESSAGE_DELETED: &str = "message-deleted";

    // 登录事件
    pub const LOGIN_ADDED: &str = "login-added";
    pub const LOGIN_REMOVED: &str = "login-removed";
    pub const LOGIN_UPDATED: &str = "login-updated";

    // 内部事件
    pub const INTERNAL: &str = "internal";
}

/// 核心事件结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 事件序列号
    pub sn: i64,
    /// 事件类型
    #[serde(rename = "type")]
    pub event_type: String,
    /// 事件时间戳（毫秒）
    pub timestamp: i64,
    /// 登录信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<Login>,
    /// 频道
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    /// 群组
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild: Option<Guild>,
    /// 消息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// 用户
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            sn: 0,
            event_type: String::new(),
            timestamp: timestamp_millis(),
            login: None,
            channel: None,
            guild: None,
            message: None,
            user: None,
        }
    }
}

impl Event {
    /// 创建基础新事件
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: timestamp_millis(),
            ..Default::default()
        }
    }

    /// 创建消息创建事件，自动提取 user/channel/guild 方便上层访问
    pub fn message_created(message: Message) -> Self {
        let user = message.user.clone();
        let channel = message.channel.clone();
        let guild = message.guild.clone();

        Self {
            event_type: event_types::MESSAGE_CREATED.to_string(),
            message: Some(message),
            user,
            channel,
            guild,
            ..Default::default()
        }
    }

    /// 创建登录增加事件
    pub fn login_added(login: Login) -> Self {
        Self {
            event_type: event_types::LOGIN_ADDED.to_string(),
            login: Some(login),
            ..Default::default()
        }
    }

    /// 创建登录移除事件
    pub fn login_removed(login: Login) -> Self {
        Self {
            event_type: event_types::LOGIN_REMOVED.to_string(),
            login: Some(login),
            ..Default::default()
        }
    }

    /// 创建登录更新事件
    pub fn login_updated(login: Login) -> Self {
        Self {
            event_type: event_types::LOGIN_UPDATED.to_string(),
            login: Some(login),
            ..Default::default()
        }
    }

    /// 设置登录信息
    pub fn with_login(mut self, login: Login) -> Self {
        self.login = Some(login);
        self
    }

    /// 是否为消息事件
    pub fn is_message_event(&self) -> bool {
        self.event_type.starts_with("message-")
    }

    /// 获取消息内容（如果是消息事件）
    pub fn content(&self) -> Option<&str> {
        self.message.as_ref().map(|m| m.content.as_str())
    }

    /// 获取发送者 ID
    pub fn sender_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// 获取频道 ID
    pub fn channel_id(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.id.as_str())
    }

    /// 获取群组 ID
    pub fn guild_id(&self) -> Option<&str> {
        self.guild.as_ref().map(|g| g.id.as_str())
    }

    /// 获取适配器名称
    pub fn adapter(&self) -> Option<&str> {
        self.login.as_ref().and_then(|l| l.adapter.as_deref())
    }
}

/// 获取当前时间戳（毫秒）
fn timestamp_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// 3. 消息元素解析工具
// ============================================================================

/// 消息元素解析工具
/// 提供消息收发所需的元素解析与构建能力
pub mod message_elements {
    use quick_xml::events::{BytesStart, Event as XmlEvent};
    use quick_xml::reader::Reader;
    use std::collections::HashMap;
    use std::fmt;

    /// Satori 标准消息元素（子集）
    #[derive(Debug, Clone, PartialEq)]
    pub enum Element {
        /// 纯文本
        Text(String),
        /// 提及用户 <at>
        At {
            id: Option<String>,
            name: Option<String>,
        },
        /// 图片 <img>
        Image { src: String, title: Option<String> },
        /// 换行 <br>
        Break,
        /// 引用 <quote>
        Quote {
            id: Option<String>,
            children: Vec<Element>,
        },
        /// 未知/自定义元素
        Unknown {
            tag: String,
            attrs: HashMap<String, String>,
            children: Vec<Element>,
        },
    }

    impl Element {
        /// 是否为纯文本
        pub fn is_text(&self) -> bool {
            matches!(self, Element::Text(_))
        }

        /// 获取文本内容（如果是 Text 元素）
        pub fn as_text(&self) -> Option<&str> {
            match self {
                Element::Text(s) => Some(s),
                _ => None,
            }
        }

        /// 是否为图片
        pub fn is_image(&self) -> bool {
            matches!(self, Element::Image { .. })
        }

        /// 获取图片链接
        pub fn image_src(&self) -> Option<&str> {
            match self {
                Element::Image { src, .. } => Some(src),
                _ => None,
            }
        }
    }

    // 实现 Display 以便将元素转回 XML 字符串
    impl fmt::Display for Element {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Element::Text(t) => write!(f, "{}", escape_xml(t)),
                Element::At { id, name } => {
                    write!(f, "<at")?;
                    if let Some(v) = id {
                        write!(f, " id=\"{}\"", escape_attr(v))?;
                    }
                    if let Some(v) = name {
                        write!(f, " name=\"{}\"", escape_attr(v))?;
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
                Element::Quote { id, children } => {
                    write!(f, "<quote")?;
                    if let Some(v) = id {
                        write!(f, " id=\"{}\"", escape_attr(v))?;
                    }
                    write!(f, ">")?;
                    for c in children {
                        write!(f, "{}", c)?;
                    }
                    write!(f, "</quote>")
                }
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

    /// 解析消息内容为元素列表
    /// 使用 quick-xml 进行完整解析
    pub fn parse(content: &str) -> Vec<Element> {
        // 为了处理 XML 片段（可能没有根节点），将其包裹在一个伪根节点中
        let wrapped_content = format!("<root>{}</root>", content);
        let mut reader = Reader::from_str(&wrapped_content);
        reader.config_mut().trim_text(false); // 保留空格

        // 解析栈：存储 (标签名, 属性, 子元素列表)
        let mut stack: Vec<(String, HashMap<String, String>, Vec<Element>)> = Vec::new();
        // 根节点的子元素容器，标签名 "__DOCUMENT_ROOT__" 仅作占位符
        stack.push(("__DOCUMENT_ROOT__".to_string(), HashMap::new(), Vec::new()));

        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(XmlEvent::Start(e)) => {
                    let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    let attrs = parse_attributes(&e);
                    stack.push((tag_name, attrs, Vec::new()));
                }
                Ok(XmlEvent::End(_)) => {
                    if stack.len() > 1 {
                        let (tag, attrs, children) = stack.pop().unwrap();

                        // 手动添加的最外层包裹节点不构建为元素，直接合并其子元素
                        if tag == "root" && stack.len() == 1 {
                            if let Some(last) = stack.last_mut() {
                                last.2.extend(children);
                            }
                        } else {
                            let element = build_element(tag.as_str(), attrs, children);
                            if let Some(last) = stack.last_mut() {
                                last.2.push(element);
                            }
                        }
                    } else {
                        break;
                    }
                }
                Ok(XmlEvent::Empty(e)) => {
                    // 自闭合标签 <tag/>
                    let tag_name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    let attrs = parse_attributes(&e);
                    let element = build_element(tag_name.as_str(), attrs, Vec::new());
                    if let Some(last) = stack.last_mut() {
                        last.2.push(element);
                    }
                }
                Ok(XmlEvent::Text(e)) => {
                    // 还原实体引用；遇到孤立的 & 等非法实体时按原始字节兜底
                    let content = match e.unescape() {
                        Ok(text) => text.to_string(),
                        Err(_) => String::from_utf8_lossy(&e).to_string(),
                    };
                    if !content.is_empty()
                        && let Some(last) = stack.last_mut()
                    {
                        last.2.push(Element::Text(content));
                    }
                }
                Ok(XmlEvent::Eof) => break,
                Err(_) => {
                    // 遇到严重错误停止解析，返回已解析部分
                    break;
                }
                _ => {} // 忽略 Comment, Decl 等
            }
            buf.clear();
        }

        // 返回伪根节点的 children
        stack
            .pop()
            .map(|(_, _, children)| children)
            .unwrap_or_default()
    }

    /// 将 quick-xml 的属性转换为 HashMap
    fn parse_attributes(e: &BytesStart) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        for attr in e.attributes().flatten() {
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            // 尝试解析值，如果 unescape 失败（极少情况），则存入空字符串以保留键
            match attr.unescape_value() {
                Ok(val) => {
                    attrs.insert(key, val.to_string());
                }
                Err(_) => {
                    attrs.insert(key, String::new());
                }
            }
        }
        attrs
    }

    /// 根据标签名、属性和子元素构建 Element
    fn build_element(
        tag: &str,
        mut attrs: HashMap<String, String>,
        children: Vec<Element>,
    ) -> Element {
        match tag {
            "at" => Element::At {
                id: attrs.remove("id"),
                name: attrs.remove("name"),
            },
            "img" => Element::Image {
                src: attrs.remove("src").unwrap_or_default(),
                title: attrs.remove("title"),
            },
            "br" => Element::Break,
            "quote" => Element::Quote {
                id: attrs.remove("id"),
                children,
            },
            _ => Element::Unknown {
                tag: tag.to_string(),
                attrs,
                children,
            },
        }
    }

    /// 将元素列表转换为纯文本
    /// 递归提取文本内容，转换 <at> 等为可读文本
    pub fn to_plain_text(elements: &[Element]) -> String {
        let mut result = String::new();
        for elem in elements {
            match elem {
                Element::Text(text) => result.push_str(text),
                Element::At { name, id } => {
                    result.push('@');
                    result.push_str(name.as_deref().or(id.as_deref()).unwrap_or("someone"));
                }
                Element::Image { title, .. } => {
                    result.push_str(title.as_deref().unwrap_or("[图片]"));
                }
                Element::Break => result.push('\n'),
                // 引用内容不属于用户新输入，跳过
                Element::Quote { .. } => {}
                Element::Unknown { children, .. } => {
                    result.push_str(&to_plain_text(children));
                }
            }
        }
        result
    }

    /// 构建消息元素（用于发送）
    /// 辅助构建器，用于生成符合 Satori 规范的 XML 字符串
    pub struct MessageBuilder {
        content: String,
    }

    impl MessageBuilder {
        pub fn new() -> Self {
            Self {
                content: String::new(),
            }
        }

        /// 添加纯文本
        pub fn text(mut self, text: impl AsRef<str>) -> Self {
            self.content.push_str(&escape_xml(text.as_ref()));
            self
        }

        /// 添加原始 XML 内容 (用于组合嵌套)
        /// 注意：不会进行转义，请确保 content 是有效的 XML 片段
        pub fn raw(mut self, content: impl AsRef<str>) -> Self {
            self.content.push_str(content.as_ref());
            self
        }

        /// 添加 @用户
        pub fn at(mut self, user_id: impl AsRef<str>) -> Self {
            self.content
                .push_str(&format!(r#"<at id="{}"/>"#, escape_attr(user_id.as_ref())));
            self
        }

        /// 添加图片
        pub fn image(mut self, src: impl AsRef<str>) -> Self {
            self.content
                .push_str(&format!(r#"<img src="{}"/>"#, escape_attr(src.as_ref())));
            self
        }

        /// 添加换行
        pub fn br(mut self) -> Self {
            self.content.push_str("<br/>");
            self
        }

        /// 添加引用 (仅 ID)
        pub fn quote(mut self, message_id: impl AsRef<str>) -> Self {
            self.content.push_str(&format!(
                r#"<quote id="{}"/>"#,
                escape_attr(message_id.as_ref())
            ));
            self
        }

        pub fn build(self) -> String {
            self.content
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
}

// ============================================================================
// 4. 指令解析工具
// ============================================================================

/// 指令解析工具库
pub mod command {
    /// 尝试匹配并剥离前缀
    ///
    /// 遍历 `prefixes` 列表，如果 `content` 以其中任意一个开头，则返回匹配到的前缀。
    pub fn match_prefix(content: &str, prefixes: &[String]) -> Option<String> {
        let trimmed = content.trim_start();
        for prefix in prefixes {
            if trimmed.starts_with(prefix) {
                return Some(prefix.clone());
            }
        }
        None
    }

    /// 尝试匹配 [前缀][指令名]，返回剩余参数文本（已去除左侧空格）
    ///
    /// 例如前缀 `/`、指令 `菜单`，消息 `/菜单 早餐` 返回 `Some("早餐")`。
    pub fn strip_command<'a>(
        content: &'a str,
        prefixes: &[String],
        command_name: &str,
    ) -> Option<&'a str> {
        let trimmed = content.trim_start();
        for prefix in prefixes {
            let target = format!("{}{}", prefix, command_name);
            if let Some(rest) = trimmed.strip_prefix(&target) {
                // 指令后必须是结尾或空白，避免 "菜单" 误命中 "菜单2"
                if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                    return Some(rest.trim_start());
                }
            }
        }
        None
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
        self.core.admin_users.contains(&user_id.to_string())
    }
}

/// 配置管理器
pub struct ConfigManager {
    path: PathBuf,
    config: RwLock<AppConfig>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: RwLock::new(AppConfig::default()),
        }
    }

    /// 获取配置文件路径
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

        let content = fs::read_to_string(&self.path)?;
        let cfg: AppConfig = toml::from_str(&content)?;

        let mut write_lock = self.config.write().await;
        *write_lock = cfg.clone();

        Ok(cfg)
    }

    /// 原子写入配置（写临时文件 -> Rename 覆盖）
    pub async fn save_atomic(&self, cfg: &AppConfig) -> BotResult<()> {
        let content = toml::to_string_pretty(cfg)?;
        let tmp_path = self.path.with_extension("tmp");
        let path_clone = self.path.clone();
        let tmp_clone = tmp_path.clone();

        // 在阻塞线程中执行同步 IO
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            // 确保父目录存在
            if let Some(parent) = path_clone.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }

            let mut file = fs::File::create(&tmp_clone)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?; // 确保落盘
            fs::rename(&tmp_clone, &path_clone)?;
            Ok(())
        })
        .await??;

        // 更新内存缓存
        let mut write_lock = self.config.write().await;
        *write_lock = cfg.clone();

        Ok(())
    }

    /// 获取当前配置（只读）
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// 更新配置（会自动保存）
    pub async fn update<F>(&self, f: F) -> BotResult<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut cfg = self.config.write().await;
        f(&mut cfg);
        let new_cfg = cfg.clone();
        drop(cfg); // 释放锁

        self.save_atomic(&new_cfg).await?;
        Ok(new_cfg)
    }
}

// ============================================================================
// 6. Logging (统一日志输出)
// ============================================================================

pub mod log {
    use chrono::Local;

    pub enum Level {
        Info,
        Warn,
        Error,
        Debug,
    }

    /// 统一日志输出函数
    /// 格式: [Time] [LEVEL] [Target      ] Message
    pub fn print(level: Level, target: &str, args: std::fmt::Arguments) {
        let now = Local::now().format("%H:%M:%S");

        // ANSI 颜色代码
        let gray = "\x1b[90m";
        let reset = "\x1b[0m";
        let cyan = "\x1b[36m";

        // Level 颜色与标签
        let (color, level_str) = match level {
            Level::Info => ("\x1b[32m", "INFO"),  // Green
            Level::Warn => ("\x1b[33m", "WARN"),  // Yellow
            Level::Error => ("\x1b[31m", "ERRO"), // Red
            Level::Debug => ("\x1b[34m", "DEBG"), // Blue
        };

        println!(
            "{}[{}] {}[{}] {} {}{}{} {}",
            gray,
            now,
            color,
            level_str,
            reset,
            cyan,
            format_args!("[{}]", target),
            reset,
            args
        );
    }
}

#[macro_export]
macro_rules! info {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Info, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Info, "System", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! warn {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Warn, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Warn, "System", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! error {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Error, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Error, "System", format_args!($($arg)+))
    );
}

#[macro_export]
macro_rules! debug {
    (target: $target:expr, $($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Debug, $target, format_args!($($arg)+))
    );
    ($($arg:tt)+) => (
        $crate::log::print($crate::log::Level::Debug, "System", format_args!($($arg)+))
    );
}

// ============================================================================
// 7. Scheduler (定时任务管理器)
// ============================================================================

use chrono::{DateTime, Local};
use std::future::Future;
use std::sync::Mutex as StdMutex;
use tokio::task::AbortHandle;

/// 全局定时任务管理器
pub struct Scheduler {
    tasks: StdMutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 添加一个灵活调度任务
    ///
    /// # 参数
    /// - `next_run_calculator`: 一个闭包，接收当前时间，返回下一次执行时间。如果返回 None，任务停止。
    /// - `task_gen`: 任务生成闭包。
    pub fn add_schedule<C, F, Fut>(&self, mut next_run_calculator: C, mut task_gen: F) -> u64
    where
        C: FnMut(DateTime<Local>) -> Option<DateTime<Local>> + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // 首次计算执行时间
        let mut next_time = next_run_calculator(Local::now());

        let handle = tokio::spawn(async move {
            while let Some(target_time) = next_time {
                let now = Local::now();

                // 计算需要 sleep 多久
                if target_time > now {
                    let duration = (target_time - now)
                        .to_std()
                        .unwrap_or(Duration::from_millis(0));
                    tokio::time::sleep(duration).await;
                }

                // 执行任务
                task_gen().await;

                // 计算下一次
                next_time = next_run_calculator(Local::now());
            }
        });

        let abort_handle = handle.abort_handle();
        self.tasks.lock().unwrap().insert(id, abort_handle);
        id
    }

    /// 固定间隔执行
    pub fn add_interval<F, Fut>(&self, duration: Duration, task_gen: F) -> u64
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_schedule(
            move |now| Some(now + chrono::Duration::from_std(duration).unwrap()),
            task_gen,
        )
    }

    /// 取消指定任务
    pub fn remove(&self, id: u64) {
        if let Some(handle) = self.tasks.lock().unwrap().remove(&id) {
            handle.abort();
        }
    }

    /// 当前任务数量
    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            info!(target: "Scheduler", "正在清理 {} 个定时任务...", tasks.len());
        }
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 8. Plugin & Adapter Traits (插件接口定义)
// ============================================================================

/// 适配器接口
/// 负责与平台通信，将平台事件转换为 Satori 事件
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// 适配器唯一标识
    fn id(&self) -> &str;

    /// 适配器名称
    fn name(&self) -> &str;

    /// 启动适配器（应在内部 spawn 自己的事件循环后立即返回）
    async fn start(&self, ctx: AdapterContext) -> BotResult<()>;

    /// 停止适配器
    async fn stop(&self) -> BotResult<()>;

    /// 发送消息到指定频道
    async fn send_message(&self, channel_id: &str, content: &str) -> BotResult<Vec<Message>>;
}

/// 适配器上下文，传递给适配器的 start 方法
pub struct AdapterContext {
    /// 事件发送通道
    pub event_tx: mpsc::Sender<Event>,
    /// 配置管理器
    pub config: Arc<ConfigManager>,
    /// 系统信号订阅
    pub system_rx: broadcast::Receiver<SystemSignal>,
}

impl Clone for AdapterContext {
    fn clone(&self) -> Self {
        Self {
            event_tx: self.event_tx.clone(),
            config: self.config.clone(),
            system_rx: self.system_rx.resubscribe(),
        }
    }
}

/// 业务逻辑插件接口
#[async_trait]
pub trait Plugin: Send + Sync {
    /// 插件唯一标识
    fn id(&self) -> &str;

    /// 插件名称
    fn name(&self) -> &str;

    /// 插件描述
    fn description(&self) -> &str {
        ""
    }

    fn default_config(&self) -> Option<toml::Value> {
        None
    }

    /// 插件版本
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

    /// 插件卸载时调用（异步清理）
    async fn on_unload(&self, _ctx: &PluginContext) -> BotResult<()> {
        Ok(())
    }

    /// 插件被清理时的回调（同步清理）
    /// 用于确保某些操作（如取消后台任务）一定执行
    fn cleanup(&self) {}

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
    scheduler: Arc<Scheduler>,
    system_tx: broadcast::Sender<SystemSignal>,
    running: Arc<AtomicBool>,
    data_base_dir: PathBuf,
    plugin_id: String,
}

impl PluginContext {
    fn new(
        plugin_id: String,
        config: Arc<ConfigManager>,
        adapters: Arc<RwLock<HashMap<String, Arc<dyn Adapter>>>>,
        scheduler: Arc<Scheduler>,
        system_tx: broadcast::Sender<SystemSignal>,
        running: Arc<AtomicBool>,
        data_base_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(PluginContextInner {
                config,
                adapters,
                scheduler,
                system_tx,
                running,
                data_base_dir,
                plugin_id,
            }),
        }
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

    /// 获取定时任务管理器
    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.inner.scheduler.clone()
    }

    /// 发送消息（便捷方法）
    pub async fn send_message(
        &self,
        adapter_id: &str,
        channel_id: &str,
        content: &str,
    ) -> BotResult<Vec<Message>> {
        let adapters = self.inner.adapters.read().await;
        if let Some(adapter) = adapters.get(adapter_id) {
            adapter.send_message(channel_id, content).await
        } else {
            Err(format!("Adapter {} not found", adapter_id).into())
        }
    }

    /// 通过事件快速回复消息
    pub async fn reply(&self, event: &Event, content: &str) -> BotResult<Vec<Message>> {
        let adapter_id = event
            .adapter()
            .ok_or_else(|| "Event has no adapter info".to_string())?;
        let channel_id = event
            .channel_id()
            .ok_or_else(|| "Event has no channel info".to_string())?;

        self.send_message(adapter_id, channel_id, content).await
    }

    /// 检查用户是否为管理员
    pub async fn is_admin(&self, user_id: &str) -> bool {
        self.config().await.is_admin(user_id)
    }

    /// 框架是否在运行中
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// 请求关闭框架
    pub fn request_shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.inner.system_tx.send(SystemSignal::Shutdown);
    }
}

// ============================================================================
// 9. System Signals (系统信号)
// ============================================================================

/// 系统信号
#[derive(Clone, Debug)]
pub enum SystemSignal {
    /// 关闭框架
    Shutdown,
}

// ============================================================================
// 10. Framework Core (框架核心)
// ============================================================================

/// 框架内部状态 (用于并发共享)
struct BotInner {
    config: Arc<ConfigManager>,
    adapters: Arc<RwLock<HashMap<String, Arc<dyn Adapter>>>>,
    plugins: Arc<Vec<Arc<dyn Plugin>>>,
    scheduler: Arc<Scheduler>,
    system_tx: broadcast::Sender<SystemSignal>,
    running: Arc<AtomicBool>,
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
    /// 创建新的框架构建器
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

    /// 构建并返回框架实例
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
    /// 内部状态 (Arc 包裹，支持并发)
    inner: Arc<BotInner>,
    /// 事件接收端 (仅在主循环使用)
    event_rx: Option<mpsc::Receiver<Event>>,
}

impl Bot {
    /// 创建框架构建器
    pub fn builder() -> BotBuilder {
        BotBuilder::new()
    }

    /// 从构建器创建框架实例
    fn from_builder(builder: BotBuilder) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1000);
        let (system_tx, _) = broadcast::channel(64);

        let config = Arc::new(ConfigManager::new(&builder.config_path));

        // 初始化适配器
        let mut adapters_map = HashMap::new();
        for adapter in builder.adapters {
            adapters_map.insert(
                adapter.id().to_string(),
                Arc::from(adapter) as Arc<dyn Adapter>,
            );
        }
        let adapters = Arc::new(RwLock::new(adapters_map));

        // 按优先级排序插件
        let mut raw_plugins = builder.plugins;
        raw_plugins.sort_by_key(|p| p.priority());
        let plugins: Vec<Arc<dyn Plugin>> = raw_plugins
            .into_iter()
            .map(|p| Arc::from(p) as Arc<dyn Plugin>)
            .collect();

        let inner = Arc::new(BotInner {
            config,
            adapters,
            plugins: Arc::new(plugins),
            scheduler: Arc::new(Scheduler::new()),
            system_tx,
            running: Arc::new(AtomicBool::new(false)),
            data_dir: builder.data_dir,
            event_tx,
        });

        Self {
            inner,
            event_rx: Some(event_rx),
        }
    }

    /// 启动框架
    pub async fn run(mut self) -> BotResult<()> {
        info!(target: "Caidan", "Caidan Bot 启动中...");

        self.inner.running.store(true, Ordering::SeqCst);

        // 1. 加载配置
        info!(target: "Caidan", "正在加载配置: {}", self.inner.config.path().display());
        let mut initial_config = self.inner.config.load().await?;
        let mut config_modified = false;

        // 1.5 配置自动注册与合并
        // 检查所有插件，如果配置中不存在该插件的块，则写入默认配置
        for plugin in self.inner.plugins.iter() {
            let pid = plugin.id();
            if !initial_config.plugins.contains_key(pid)
                && let Some(def_cfg) = plugin.default_config()
            {
                info!(target: "Caidan", "+ 初始化插件配置: {}", plugin.name());
                initial_config.plugins.insert(pid.to_string(), def_cfg);
                config_modified = true;
            }
        }

        // 如果配置有更新，原子落盘
        if config_modified {
            self.inner.config.save_atomic(&initial_config).await?;
        }

        // 2. 确保数据目录存在
        tokio::fs::create_dir_all(&self.inner.data_dir).await?;
        info!(target: "Caidan", "数据目录: {}", self.inner.data_dir.display());

        // 3. 初始化插件
        for plugin in self.inner.plugins.iter() {
            let ctx = self.inner.create_plugin_context(plugin.id());
            if let Err(e) = plugin.on_load(&ctx).await {
                error!(target: "Caidan", "插件 {} 初始化失败: {}", plugin.name(), e);
            } else {
                info!(target: "Caidan", "✅ {} v{} 已加载", plugin.name(), plugin.version());
            }
        }

        // 4. 启动适配器
        let adapters = self.inner.adapters.read().await;
        for (id, adapter) in adapters.iter() {
            let adapter_clone = adapter.clone();
            let ctx = AdapterContext {
                event_tx: self.inner.event_tx.clone(),
                config: self.inner.config.clone(),
                system_rx: self.inner.system_tx.subscribe(),
            };

            let id_clone = id.clone();
            let adapter_name = adapter.name().to_string();

            tokio::spawn(async move {
                if let Err(e) = adapter_clone.start(ctx).await {
                    error!(target: "Adapter", "适配器 {} 运行错误: {}", id_clone, e);
                }
            });

            info!(target: "Caidan", "🔗 {} ({}) 已启动", adapter_name, id);
        }
        drop(adapters);

        // 5. 进入事件循环
        info!(target: "Caidan", "事件循环已启动，等待消息...");

        let mut event_rx = self.event_rx.take().ok_or("event_rx already taken")?;
        let mut system_rx = self.inner.system_tx.subscribe();

        loop {
            tokio::select! {
                // 处理系统信号
                Ok(signal) = system_rx.recv() => {
                    match signal {
                        SystemSignal::Shutdown => {
                            info!(target: "Caidan", "收到关闭信号，正在停止...");
                            break;
                        }
                    }
                }

                // 处理事件 (使用 tokio::spawn 实现并行处理)
                Some(event) = event_rx.recv() => {
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.process_event(event).await {
                            error!(target: "Caidan", "事件处理错误: {}", e);
                        }
                    });
                }

                // 检查运行状态
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    if !self.inner.running.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }

        // 清理
        self.shutdown().await?;
        info!(target: "Caidan", "框架已停止");

        Ok(())
    }

    /// 关闭框架
    async fn shutdown(&self) -> BotResult<()> {
        self.inner.running.store(false, Ordering::SeqCst);

        // 停止所有适配器
        let adapters = self.inner.adapters.read().await;
        for (id, adapter) in adapters.iter() {
            if let Err(e) = adapter.stop().await {
                error!(target: "Caidan", "停止适配器 {} 时发生错误: {}", id, e);
            }
        }

        // 卸载所有插件 (异步卸载 + 同步 cleanup 兜底)
        for plugin in self.inner.plugins.iter() {
            let ctx = self.inner.create_plugin_context(plugin.id());
            if let Err(e) = plugin.on_unload(&ctx).await {
                error!(target: "Caidan", "卸载插件 {} 时发生错误: {}", plugin.name(), e);
            }
            plugin.cleanup();
        }

        // 取消所有后台定时任务
        self.inner.scheduler.shutdown();

        Ok(())
    }

    /// 注入事件（用于测试或外部触发）
    pub async fn inject_event(&self, event: Event) -> BotResult<()> {
        self.inner.event_tx.send(event).await.map_err(|e| e.into())
    }
}

// 内部状态实现方法
impl BotInner {
    /// 处理单个事件：按优先级顺序分发给插件
    async fn process_event(&self, event: Event) -> BotResult<()> {
        for plugin in self.plugins.iter() {
            let ctx = self.create_plugin_context(plugin.id());

            match plugin.on_event(&ctx, &event).await {
                Ok(EventResult::Stop) => break,
                Ok(EventResult::Continue) => continue,
                Err(e) => {
                    error!(target: "Caidan", "插件 {} 处理事件时发生错误: {}", plugin.name(), e);
                }
            }
        }

        Ok(())
    }

    fn create_plugin_context(&self, plugin_id: &str) -> PluginContext {
        PluginContext::new(
            plugin_id.to_string(),
            self.config.clone(),
            self.adapters.clone(),
            self.scheduler.clone(),
            self.system_tx.clone(),
            self.running.clone(),
            self.data_dir.clone(),
        )
    }
}

// ============================================================================
// 11. Re-exports (重新导出)
// ============================================================================

pub mod prelude {
    //! 常用类型的预导入模块
    //!
    //! 建议在开发插件时使用：
    //! ```rust
    //! use caidan::prelude::*;
    //! ```

    // 1. 框架核心与错误处理
    pub use super::{Bot, BotBuilder, BotError, BotResult};

    // 2. 插件与适配器系统 (核心 API)
    pub use super::{
        Adapter, AdapterContext, EventResult, Plugin, PluginContext, Scheduler, SystemSignal,
    };

    // 3. 配置对象
    pub use super::{AppConfig, ConfigManager, CoreConfig};

    // 4. Satori 协议数据模型
    pub use super::{Channel, ChannelType, Event, Guild, Login, LoginStatus, Message, User};

    // 5. 工具模块
    pub use super::{command, event_types, message_elements};

    // 6. 常用工具类型
    pub use super::message_elements::{Element, MessageBuilder};

    // 7. 外部依赖
    pub use async_trait::async_trait;

    // 导出 toml 供插件序列化配置使用
    pub use toml;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::message_elements::{Element, MessageBuilder, parse, to_plain_text};
    use super::*;

    #[test]
    fn parse_plain_text_roundtrip() {
        let elements = parse("你好 菜单");
        assert_eq!(elements, vec![Element::Text("你好 菜单".to_string())]);
        assert_eq!(to_plain_text(&elements), "你好 菜单");
    }

    #[test]
    fn parse_mixed_elements() {
        let elements = parse(r#"<quote id="42"/>早餐<br/><at id="10001"/>"#);
        assert_eq!(elements.len(), 4);
        assert!(matches!(elements[0], Element::Quote { .. }));
        assert_eq!(elements[1].as_text(), Some("早餐"));
        assert_eq!(elements[2], Element::Break);
        assert!(matches!(elements[3], Element::At { .. }));

        // 引用内容不计入纯文本
        assert_eq!(to_plain_text(&elements), "早餐\n@10001");
    }

    #[test]
    fn parse_image_element() {
        let elements = parse(r#"<img src="file:///menu/A.png" title="A"/>"#);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].image_src(), Some("file:///menu/A.png"));
    }

    #[test]
    fn builder_escapes_text() {
        let content = MessageBuilder::new()
            .text("a < b & c")
            .br()
            .image("file:///tmp/x y.png")
            .build();
        assert_eq!(
            content,
            r#"a &lt; b &amp; c<br/><img src="file:///tmp/x y.png"/>"#
        );

        // 转义后的内容可以被重新解析还原
        let elements = parse(&content);
        assert_eq!(to_plain_text(&parse("a &lt; b &amp; c")), "a < b & c");
        assert_eq!(elements[2].image_src(), Some("file:///tmp/x y.png"));
    }

    #[test]
    fn match_prefix_and_strip_command() {
        let prefixes = vec!["/".to_string(), ".".to_string()];

        assert_eq!(
            command::match_prefix("/菜单", &prefixes),
            Some("/".to_string())
        );
        assert_eq!(command::match_prefix("菜单", &prefixes), None);

        assert_eq!(command::strip_command("/菜单", &prefixes, "菜单"), Some(""));
        assert_eq!(
            command::strip_command(".刷新菜单  now", &prefixes, "刷新菜单"),
            Some("now")
        );
        // 指令名是另一个词的前缀时不应误命中
        assert_eq!(command::strip_command("/菜单2", &prefixes, "菜单"), None);
        assert_eq!(command::strip_command("/帮助", &prefixes, "菜单"), None);
    }

    #[test]
    fn app_config_admin_and_plugin_section() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [core]
            cmd_prefix = ["/"]
            admin_users = ["10001"]

            [menu]
            enabled = true
            ttl_secs = 60
            "#,
        )
        .unwrap();

        assert!(cfg.is_admin("10001"));
        assert!(!cfg.is_admin("20002"));

        #[derive(Deserialize)]
        struct MenuSection {
            enabled: bool,
            ttl_secs: u64,
        }
        let section: MenuSection = cfg.get_plugin_config("menu").unwrap();
        assert!(section.enabled);
        assert_eq!(section.ttl_secs, 60);
    }

    #[tokio::test]
    async fn config_manager_load_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let manager = ConfigManager::new(&path);
        let cfg = manager.load().await.unwrap();

        assert!(path.exists());
        assert_eq!(cfg.core.cmd_prefix, vec!["/".to_string(), ".".to_string()]);

        // 再次加载应读回同样的默认值
        let cfg2 = manager.load().await.unwrap();
        assert_eq!(cfg2.core.cmd_prefix, cfg.core.cmd_prefix);
    }

    #[tokio::test]
    async fn scheduler_remove_cancels_task() {
        use std::sync::atomic::AtomicUsize;

        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let id = scheduler.add_interval(Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(scheduler.task_count(), 1);

        tokio::time::sleep(Duration::from_millis(35)).await;
        scheduler.remove(id);
        assert_eq!(scheduler.task_count(), 0);

        let after_remove = counter.load(Ordering::SeqCst);
        assert!(after_remove >= 1);

        // 取消后不再执行
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_remove);
    }
}
