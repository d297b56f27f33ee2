//! 聊天 CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示会话同步功能
//! 启动时通过命令行参数指定用户，自动连接并打印接收到的事件；
//! 可选地解析/打开与某个对端的会话并发送一条消息

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use tutorlink_chat_core::chat::listener::ChatListener;
use tutorlink_chat_core::chat::store::{ChatConfig, ConversationStore, ResolveOutcome};
use tutorlink_chat_core::chat::types::UserRef;

/// 聊天 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "chat-cli")]
#[command(about = "聊天 CLI 客户端 - 用于测试和展示会话同步功能", long_about = None)]
struct Args {
    /// 用户 ID
    #[arg(short, long)]
    user_id: i64,

    /// 认证 token
    #[arg(short, long)]
    token: String,

    /// REST API 地址
    #[arg(long, default_value = "http://localhost:8080/api")]
    api_url: String,

    /// WebSocket 地址
    #[arg(long, default_value = "ws://localhost:8080")]
    ws_url: String,

    /// 本地缓存数据库地址
    #[arg(long, default_value = "sqlite://chat_cache.db?mode=rwc")]
    cache_db: String,

    /// 对端用户 ID（指定后自动解析并打开会话）
    #[arg(short, long)]
    peer_id: Option<i64>,

    /// 打开会话后发送的消息内容
    #[arg(short, long)]
    message: Option<String>,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,tutorlink_chat_core=debug）
    #[arg(long, default_value = "info,tutorlink_chat_core=debug")]
    log_level: String,
}

/// 按字符截断预览（CJK 等多字节字符不能在字节偏移处截断）
fn truncate_preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // 创建日志文件（追加模式）
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    // 输出到 stdout（控制台），保留 ANSI 颜色代码用于终端显示
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 输出到文件，禁用 ANSI 颜色代码（文件不需要颜色）
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

/// 监听器：输出所有接收到的事件
struct CliChatListener;

#[async_trait::async_trait]
impl ChatListener for CliChatListener {
    async fn on_connected(&self, via_push: bool) {
        if via_push {
            info!("[CLI/Chat] 🔗 已连接（推送模式）");
        } else {
            warn!("[CLI/Chat] 🔗 已连接（轮询降级模式）");
        }
    }

    async fn on_transport_degraded(&self, reason: String) {
        warn!("[CLI/Chat] ⚠️ 推送通道降级: {}", reason);
    }

    async fn on_offline(&self, scope: String) {
        warn!("[CLI/Chat] 📴 离线数据兜底: {}", scope);
    }

    async fn on_conversation_list_changed(&self, conversations_json: String) {
        info!("[CLI/Chat] 🔄 会话列表变更: {}", conversations_json);
    }

    async fn on_new_message(&self, message_json: String) {
        info!("[CLI/Chat] 📨 收到新消息: {}", message_json);
    }

    async fn on_message_state_changed(&self, message_json: String) {
        info!("[CLI/Chat] 📖 消息状态变更: {}", message_json);
    }

    async fn on_unread_count_changed(&self, total_unread_count: i32) {
        info!("[CLI/Chat] 📬 总未读数: {}", total_unread_count);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    init_logger(&args.log_level);

    info!("[CLI] 🚀 聊天 CLI 客户端（测试模式）");
    info!("[CLI] 👤 用户 ID: {}", args.user_id);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let config = ChatConfig {
        user_id: args.user_id,
        token: args.token.clone(),
        api_base_url: args.api_url.clone(),
        ws_url: args.ws_url.clone(),
        cache_db_url: args.cache_db.clone(),
    };
    let store = ConversationStore::new(config, Arc::new(CliChatListener)).await?;

    // 连接
    info!("[CLI] 🔗 正在连接...");
    store
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("连接失败: {}", e))?;
    info!("[CLI] ✅ 连接成功！");

    // 显示初始信息
    let conversations = store.conversations().await;
    info!("[CLI] 📋 会话列表（共 {} 个）:", conversations.len());
    for conv in conversations.iter().take(5) {
        info!(
            "[CLI]   - {} | 对端: {} | 未读: {} | 最新: {}",
            conv.id,
            conv.peer_of(args.user_id).name,
            conv.unread_count,
            truncate_preview(&conv.last_message, 30)
        );
    }
    info!("[CLI] 📬 总未读数: {}", store.total_unread().await);

    // 可选：解析并打开与对端的会话
    if let Some(peer_id) = args.peer_id {
        let peer = UserRef::new(peer_id, format!("user_{}", peer_id));
        let outcome = store.resolve_or_create(&peer).await?;
        match &outcome {
            ResolveOutcome::Found(c) => info!("[CLI] 📎 复用会话: {}", c.id),
            ResolveOutcome::Created(c) => info!("[CLI] ✅ 新建会话: {}", c.id),
            ResolveOutcome::LocalOnly(c) => warn!("[CLI] 📴 本地兜底会话: {}", c.id),
        }

        let messages = store.open_conversation(&outcome.conversation().id).await?;
        info!("[CLI] 📂 会话已打开，历史消息 {} 条", messages.len());
        for msg in messages.iter().rev().take(5).rev() {
            info!(
                "[CLI]   [{}] {} -> {}: {}",
                msg.timestamp, msg.sender_id, msg.receiver_id, msg.content
            );
        }
        store.mark_conversation_read().await?;

        if let Some(content) = &args.message {
            match store.send_message(content).await {
                Ok(sent) => info!(
                    "[CLI] 📤 消息已发送 (id={}, state={:?})",
                    sent.id, sent.delivery_state
                ),
                Err(e) => error!("[CLI] ❌ 发送失败: {}", e),
            }
        }
    }

    info!("[CLI] 📥 开始监听消息...");
    info!("[CLI] 💡 提示：程序将持续运行并显示接收到的所有消息和事件");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
        store.disconnect().await;
        info!("[CLI] 👋 程序退出");
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        // 持续运行直到被中断
        loop {
            sleep(Duration::from_secs(3600)).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::truncate_preview;

    #[test]
    fn test_truncate_preview_respects_char_boundaries() {
        // 中英混排：第 30 个字节落在多字节字符中间也不允许崩溃
        let mixed = format!("a{}", "你好世界真不错".repeat(3));
        let cut = truncate_preview(&mixed, 30);
        assert_eq!(cut.chars().count(), 30);
        assert!(mixed.starts_with(&cut));
        assert_eq!(truncate_preview("short", 30), "short");
        assert_eq!(truncate_preview("", 30), "");
    }
}
