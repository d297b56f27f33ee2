//! 聊天事件监听器回调接口

use async_trait::async_trait;

/// 聊天引擎监听器回调接口（由调用方注册，JSON 字符串负载）
#[async_trait]
pub trait ChatListener: Send + Sync {
    /// 会话建立完成；`via_push` 为 false 表示已降级为轮询
    async fn on_connected(&self, via_push: bool);

    /// 推送通道不可用，已切换到轮询降级模式
    async fn on_transport_degraded(&self, reason: String);

    /// 端点全部失败、数据来自本地缓存（软"离线"提示，非硬错误）
    async fn on_offline(&self, scope: String);

    /// 会话列表变更
    async fn on_conversation_list_changed(&self, conversations_json: String);

    /// 收到新消息（含乐观本地回显）
    async fn on_new_message(&self, message_json: String);

    /// 消息投递状态变更（确认 / localOnly 降级）
    async fn on_message_state_changed(&self, message_json: String);

    /// 总未读数变更
    async fn on_unread_count_changed(&self, total_unread: i32);
}

/// 空实现（默认监听器）
pub struct EmptyChatListener;

#[async_trait]
impl ChatListener for EmptyChatListener {
    async fn on_connected(&self, _via_push: bool) {}
    async fn on_transport_degraded(&self, _reason: String) {}
    async fn on_offline(&self, _scope: String) {}
    async fn on_conversation_list_changed(&self, _conversations_json: String) {}
    async fn on_new_message(&self, _message_json: String) {}
    async fn on_message_state_changed(&self, _message_json: String) {}
    async fn on_unread_count_changed(&self, _total_unread: i32) {}
}
