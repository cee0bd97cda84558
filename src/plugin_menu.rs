// plugin_menu.rs
//
// 图片菜单插件：把用户输入的名称映射为 menu 目录下的图片并回复。
// 查找走 TTL 快照缓存，后台定时任务周期性整体失效。

mod cache;

use caidan::prelude::*;
use caidan::{debug, info, warn};
use cache::MenuCache;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const LOG_TARGET: &str = "Menu";

/// 菜单插件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuConfig {
    /// 是否启用
    pub enabled: bool,
    /// 列表指令及其别名
    pub commands: Vec<String>,
    /// 图片目录（留空则使用插件数据目录下的 menu 子目录）
    pub menu_dir: String,
    /// 缓存有效期（秒）
    pub ttl_secs: u64,
    /// 后台整体失效周期（秒）
    pub purge_interval_secs: u64,
    /// 是否开启模糊匹配（忽略大小写的子串匹配）
    pub fuzzy_match: bool,
    /// 未命中时是否回复提示
    pub reply_on_miss: bool,
    /// 参与查找的文本最大长度（字符数）
    pub max_name_len: usize,
}

impl Default for MenuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            commands: vec!["菜单".to_string(), "帮助".to_string(), "功能".to_string()],
            menu_dir: String::new(),
            ttl_secs: 300,
            purge_interval_secs: 1800,
            fuzzy_match: false,
            reply_on_miss: true,
            max_name_len: 50,
        }
    }
}

/// 图片菜单插件
pub struct MenuPlugin {
    cache: OnceLock<std::sync::Arc<MenuCache>>,
    scheduler: OnceLock<std::sync::Arc<Scheduler>>,
    /// 后台失效任务 ID，0 表示未启动
    purge_task: AtomicU64,
}

impl MenuPlugin {
    pub fn new() -> Self {
        Self {
            cache: OnceLock::new(),
            scheduler: OnceLock::new(),
            purge_task: AtomicU64::new(0),
        }
    }

    /// 解析图片目录：配置留空时落在插件数据目录下
    async fn resolve_menu_dir(&self, ctx: &PluginContext, cfg: &MenuConfig) -> BotResult<PathBuf> {
        if cfg.menu_dir.trim().is_empty() {
            let data_dir = ctx.ensure_data_dir().await?;
            Ok(data_dir.join("menu"))
        } else {
            Ok(PathBuf::from(cfg.menu_dir.trim()))
        }
    }

    /// 停掉后台失效任务并清空缓存（卸载路径，可重复调用）
    fn teardown(&self) {
        let task_id = self.purge_task.swap(0, Ordering::SeqCst);
        if task_id != 0
            && let Some(scheduler) = self.scheduler.get()
        {
            scheduler.remove(task_id);
            debug!(target: LOG_TARGET, "后台失效任务已取消");
        }

        if let Some(cache) = self.cache.get() {
            cache.invalidate();
        }
    }

    /// 列表指令：展示当前可用的图片名称
    async fn handle_list(&self, ctx: &PluginContext, event: &Event) -> BotResult<EventResult> {
        let Some(cache) = self.cache.get() else {
            return Ok(EventResult::Continue);
        };

        match cache.list_names() {
            Ok(names) if names.is_empty() => {
                let msg = format!(
                    "菜单是空的，把图片放进 {} 再来试试吧",
                    cache.dir().display()
                );
                ctx.reply(event, &MessageBuilder::new().text(msg).build()).await?;
            }
            Ok(names) => {
                let msg = format!("可用的图片列表：\n{}", names.join("\n"));
                ctx.reply(event, &MessageBuilder::new().text(msg).build()).await?;
            }
            Err(e) => {
                warn!(target: LOG_TARGET, "列出菜单失败: {}", e);
                ctx.reply(event, &MessageBuilder::new().text(e.to_string()).build())
                    .await?;
            }
        }

        Ok(EventResult::Stop)
    }

    /// 刷新指令（管理员）：强制重扫并报告前后数量
    async fn handle_refresh(&self, ctx: &PluginContext, event: &Event) -> BotResult<EventResult> {
        if !self.sender_is_admin(ctx, event).await {
            ctx.reply(
                event,
                &MessageBuilder::new().text("该指令仅管理员可用").build(),
            )
            .await?;
            return Ok(EventResult::Stop);
        }

        let Some(cache) = self.cache.get() else {
            return Ok(EventResult::Continue);
        };

        match cache.refresh() {
            Ok((before, after)) => {
                info!(target: LOG_TARGET, "手动刷新: {} -> {} 张图片", before, after);
                let msg = format!("菜单已刷新：{} -> {} 张图片", before, after);
                ctx.reply(event, &MessageBuilder::new().text(msg).build()).await?;
            }
            Err(e) => {
                warn!(target: LOG_TARGET, "刷新菜单失败: {}", e);
                let msg = format!("刷新失败：{}", e);
                ctx.reply(event, &MessageBuilder::new().text(msg).build()).await?;
            }
        }

        Ok(EventResult::Stop)
    }

    /// 清空指令（管理员）：手动整体失效
    async fn handle_clear(&self, ctx: &PluginContext, event: &Event) -> BotResult<EventResult> {
        if !self.sender_is_admin(ctx, event).await {
            ctx.reply(
                event,
                &MessageBuilder::new().text("该指令仅管理员可用").build(),
            )
            .await?;
            return Ok(EventResult::Stop);
        }

        let Some(cache) = self.cache.get() else {
            return Ok(EventResult::Continue);
        };

        cache.invalidate();
        info!(target: LOG_TARGET, "菜单缓存已手动清空");
        ctx.reply(
            event,
            &MessageBuilder::new()
                .text("菜单缓存已清空，下次查询时将重新扫描")
                .build(),
        )
        .await?;

        Ok(EventResult::Stop)
    }

    /// 统计指令（管理员）：数量、扩展名分布、占用空间、失踪文件
    async fn handle_stats(&self, ctx: &PluginContext, event: &Event) -> BotResult<EventResult> {
        if !self.sender_is_admin(ctx, event).await {
            ctx.reply(
                event,
                &MessageBuilder::new().text("该指令仅管理员可用").build(),
            )
            .await?;
            return Ok(EventResult::Stop);
        }

        let Some(cache) = self.cache.get() else {
            return Ok(EventResult::Continue);
        };

        match cache.stats() {
            Ok(stats) => {
                let mut lines = vec![format!("菜单统计（共 {} 张图片）", stats.total)];

                if !stats.by_extension.is_empty() {
                    let dist = stats
                        .by_extension
                        .iter()
                        .map(|(ext, n)| format!("{} x{}", ext, n))
                        .collect::<Vec<_>>()
                        .join("，");
                    lines.push(format!("扩展名分布：{}", dist));
                }

                lines.push(format!(
                    "占用空间：{}（平均 {}）",
                    format_bytes(stats.total_bytes),
                    format_bytes(stats.average_bytes())
                ));

                if !stats.missing.is_empty() {
                    lines.push(format!("文件已失踪：{}", stats.missing.join("，")));
                }

                ctx.reply(
                    event,
                    &MessageBuilder::new().text(lines.join("\n")).build(),
                )
                .await?;
            }
            Err(e) => {
                warn!(target: LOG_TARGET, "菜单统计失败: {}", e);
                ctx.reply(event, &MessageBuilder::new().text(e.to_string()).build())
                    .await?;
            }
        }

        Ok(EventResult::Stop)
    }

    /// 裸文本查找：名称 -> 图片回复
    async fn handle_lookup(
        &self,
        ctx: &PluginContext,
        event: &Event,
        cfg: &MenuConfig,
        name: &str,
    ) -> BotResult<EventResult> {
        let Some(cache) = self.cache.get() else {
            return Ok(EventResult::Continue);
        };

        match cache.find_by_name(name) {
            Ok(Some(path)) => {
                // 扫描和使用之间文件可能被删除，发送前再确认一次
                if !path.is_file() {
                    warn!(target: LOG_TARGET, "图片已失踪: {}", path.display());
                    ctx.reply(
                        event,
                        &MessageBuilder::new()
                            .text(format!("加载图片 '{}' 失败", name.trim()))
                            .build(),
                    )
                    .await?;
                    return Ok(EventResult::Stop);
                }

                let content = MessageBuilder::new()
                    .text(format!("这是 {}：", name.trim()))
                    .br()
                    .image(file_url(&path))
                    .build();
                ctx.reply(event, &content).await?;
                Ok(EventResult::Stop)
            }
            Ok(None) => {
                if cfg.reply_on_miss {
                    let msg = format!("未找到名为 '{}' 的图片", name.trim());
                    ctx.reply(event, &MessageBuilder::new().text(msg).build()).await?;
                    return Ok(EventResult::Stop);
                }
                Ok(EventResult::Continue)
            }
            Err(e) => {
                // 查找失败不打扰用户，记录后放行给其他插件
                warn!(target: LOG_TARGET, "查找图片失败: {}", e);
                Ok(EventResult::Continue)
            }
        }
    }

    async fn sender_is_admin(&self, ctx: &PluginContext, event: &Event) -> bool {
        match event.sender_id() {
            Some(id) => ctx.is_admin(id).await,
            None => false,
        }
    }
}

impl Default for MenuPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for MenuPlugin {
    fn id(&self) -> &str {
        "menu"
    }

    fn name(&self) -> &str {
        "图片菜单"
    }

    fn description(&self) -> &str {
        "将用户输入的名称映射为 menu 目录下的图片并回复"
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn default_config(&self) -> Option<toml::Value> {
        toml::Value::try_from(MenuConfig::default()).ok()
    }

    async fn on_load(&self, ctx: &PluginContext) -> BotResult<()> {
        let cfg: MenuConfig = ctx.plugin_config().await.unwrap_or_default();
        if !cfg.enabled {
            info!(target: LOG_TARGET, "菜单插件已禁用");
            return Ok(());
        }

        let menu_dir = self.resolve_menu_dir(ctx, &cfg).await?;

        // 目录引导：创建失败只告警，插件保持加载（后续查询会报目录不存在）
        if let Err(e) = tokio::fs::create_dir_all(&menu_dir).await {
            warn!(target: LOG_TARGET, "创建菜单目录 {} 失败: {}", menu_dir.display(), e);
        } else {
            info!(target: LOG_TARGET, "菜单目录: {}", menu_dir.display());
        }

        let cache = std::sync::Arc::new(MenuCache::new(
            &menu_dir,
            Duration::from_secs(cfg.ttl_secs),
            cfg.fuzzy_match,
        ));
        let _ = self.cache.set(cache.clone());

        // 后台周期性整体失效，任务归插件生命周期所有
        let scheduler = ctx.scheduler();
        let _ = self.scheduler.set(scheduler.clone());

        let purge_cache = cache.clone();
        let task_id = scheduler.add_interval(
            Duration::from_secs(cfg.purge_interval_secs),
            move || {
                let cache = purge_cache.clone();
                async move {
                    cache.invalidate();
                    debug!(target: LOG_TARGET, "后台任务：菜单缓存已失效");
                }
            },
        );
        self.purge_task.store(task_id, Ordering::SeqCst);

        Ok(())
    }

    async fn on_unload(&self, _ctx: &PluginContext) -> BotResult<()> {
        self.teardown();
        info!(target: LOG_TARGET, "菜单插件已卸载");
        Ok(())
    }

    fn cleanup(&self) {
        self.teardown();
    }

    async fn on_event(&self, ctx: &PluginContext, event: &Event) -> BotResult<EventResult> {
        if event.event_type != event_types::MESSAGE_CREATED {
            return Ok(EventResult::Continue);
        }
        // 机器人自己的消息不参与查找，避免回复循环
        if event
            .user
            .as_ref()
            .and_then(|u| u.is_bot)
            .unwrap_or(false)
        {
            return Ok(EventResult::Continue);
        }
        let Some(raw) = event.content() else {
            return Ok(EventResult::Continue);
        };

        let cfg: MenuConfig = ctx.plugin_config().await.unwrap_or_default();
        if !cfg.enabled {
            return Ok(EventResult::Continue);
        }

        let elements = message_elements::parse(raw);
        let text = message_elements::to_plain_text(&elements).trim().to_string();
        if text.is_empty() {
            return Ok(EventResult::Continue);
        }

        let prefixes = ctx.config().await.core.cmd_prefix;

        // 列表指令及别名
        for alias in &cfg.commands {
            if command::strip_command(&text, &prefixes, alias).is_some() {
                return self.handle_list(ctx, event).await;
            }
        }

        // 管理指令
        if command::strip_command(&text, &prefixes, "刷新菜单").is_some() {
            return self.handle_refresh(ctx, event).await;
        }
        if command::strip_command(&text, &prefixes, "清空菜单").is_some() {
            return self.handle_clear(ctx, event).await;
        }
        if command::strip_command(&text, &prefixes, "菜单统计").is_some() {
            return self.handle_stats(ctx, event).await;
        }

        // 其他插件的指令不参与图片查找
        if command::match_prefix(&text, &prefixes).is_some() {
            return Ok(EventResult::Continue);
        }

        // 过长文本不可能是图片名，直接放行
        if text.chars().count() > cfg.max_name_len {
            return Ok(EventResult::Continue);
        }

        self.handle_lookup(ctx, event, &cfg, &text).await
    }
}

/// 本地路径转 file:// URL
fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// 字节数的可读展示
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;

    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let value = toml::Value::try_from(MenuConfig::default()).unwrap();
        let cfg: MenuConfig = value.try_into().unwrap();

        assert!(cfg.enabled);
        assert_eq!(cfg.ttl_secs, 300);
        assert_eq!(cfg.purge_interval_secs, 1800);
        assert!(!cfg.fuzzy_match);
        assert!(cfg.reply_on_miss);
        assert_eq!(cfg.max_name_len, 50);
        assert_eq!(cfg.commands, vec!["菜单", "帮助", "功能"]);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: MenuConfig = toml::from_str("ttl_secs = 60").unwrap();
        assert_eq!(cfg.ttl_secs, 60);
        assert!(cfg.enabled);
        assert_eq!(cfg.purge_interval_secs, 1800);
    }

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
