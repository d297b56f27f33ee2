//! 会话存储：对 UI 暴露的顶层门面
//!
//! 装配 API 客户端、本地缓存、传输会话与分页器，持有会话列表与当前
//! 活动会话的内存视图。所有用户可见的操作（刷新列表、打开会话、发送
//! 消息、翻页、已读）都从这里进入。

use crate::chat::api::ChatApi;
use crate::chat::cache::LocalCache;
use crate::chat::error::ChatError;
use crate::chat::listener::ChatListener;
use crate::chat::pagination::Paginator;
use crate::chat::reconcile::{self, MergeOutcome};
use crate::chat::transport::{InboundHandler, Transport};
use crate::chat::types::{
    generate_local_id, now_millis, Conversation, DeliveryState, Message, UserRef,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub user_id: i64,
    pub token: String,
    pub api_base_url: String,
    pub ws_url: String,
    pub cache_db_url: String,
}

impl ChatConfig {
    pub fn new(user_id: i64, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
            api_base_url: "http://localhost:8080/api".to_string(),
            ws_url: "ws://localhost:8080".to_string(),
            cache_db_url: "sqlite://chat_cache.db?mode=rwc".to_string(),
        }
    }
}

/// 会话解析结果
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// 本地列表中已有该配对的会话
    Found(Conversation),
    /// 服务端新建成功
    Created(Conversation),
    /// 服务端不可达，合成了仅本地的兜底会话
    LocalOnly(Conversation),
}

impl ResolveOutcome {
    pub fn conversation(&self) -> &Conversation {
        match self {
            ResolveOutcome::Found(c)
            | ResolveOutcome::Created(c)
            | ResolveOutcome::LocalOnly(c) => c,
        }
    }
}

/// 活动会话的内存视图（同一时刻至多一个）
struct ActiveConversation {
    id: RwLock<Option<String>>,
    messages: RwLock<Vec<Message>>,
}

/// 入站消息路由：传输层投来的消息调和进活动会话视图
struct InboundRouter {
    active: Arc<ActiveConversation>,
    cache: Arc<LocalCache>,
    listener: Arc<dyn ChatListener>,
}

#[async_trait]
impl InboundHandler for InboundRouter {
    async fn on_inbound(&self, message: Message) {
        // 传输层已按订阅过滤，这里再对活动会话做一次过期守卫
        let active_id = self.active.id.read().await.clone();
        if active_id.as_deref() != Some(message.conversation_id.as_str()) {
            debug!(
                "[Store] 丢弃过期入站消息 (conversationID={})",
                message.conversation_id
            );
            return;
        }

        let conversation_id = message.conversation_id.clone();
        let payload = serde_json::to_string(&message).unwrap_or_default();

        let snapshot;
        let outcome;
        {
            let mut msgs = self.active.messages.write().await;
            outcome = reconcile::merge(&mut msgs, message);
            snapshot = msgs.clone();
        }

        if let Err(e) = self.cache.save_messages(&conversation_id, &snapshot).await {
            warn!("[Store] ⚠️ 入站消息缓存写入失败: {}", e);
        }

        match outcome {
            MergeOutcome::Appended => self.listener.on_new_message(payload).await,
            MergeOutcome::Replaced | MergeOutcome::EchoCollapsed => {
                self.listener.on_message_state_changed(payload).await
            }
        }
    }
}

/// 会话存储
pub struct ConversationStore {
    config: ChatConfig,
    api: Arc<ChatApi>,
    cache: Arc<LocalCache>,
    transport: Arc<Transport>,
    paginator: Paginator,
    listener: Arc<dyn ChatListener>,
    conversations: RwLock<Vec<Conversation>>,
    /// 临时会话 ID → 服务端权威 ID（别名一旦建立永久有效）
    aliases: RwLock<HashMap<String, String>>,
    active: Arc<ActiveConversation>,
}

impl ConversationStore {
    pub async fn new(config: ChatConfig, listener: Arc<dyn ChatListener>) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", config.token)
                .parse()
                .context("token 无法作为请求头")?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .context("构建 HTTP 客户端失败")?;

        let api = Arc::new(ChatApi::new(
            client,
            config.api_base_url.clone(),
            config.user_id,
        ));
        let cache = Arc::new(LocalCache::new(&config.cache_db_url).await?);
        let transport = Arc::new(Transport::new(
            config.user_id,
            config.token.clone(),
            config.ws_url.clone(),
            api.clone(),
            cache.clone(),
            listener.clone(),
        ));
        let paginator = Paginator::new(api.clone(), cache.clone());

        Ok(Self {
            config,
            api,
            cache,
            transport,
            paginator,
            listener,
            conversations: RwLock::new(Vec::new()),
            aliases: RwLock::new(HashMap::new()),
            active: Arc::new(ActiveConversation {
                id: RwLock::new(None),
                messages: RwLock::new(Vec::new()),
            }),
        })
    }

    /// 建立传输会话并刷新会话列表
    pub async fn connect(&self) -> Result<()> {
        info!("[Store] 🚀 启动会话同步 (user={})", self.config.user_id);
        self.transport.connect().await?;
        self.refresh_conversations().await?;
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// 刷新会话列表
    ///
    /// 端点耗尽时回退到本地缓存并上报软离线；两种来源都保留本地
    /// 兜底会话（它们在服务端不存在，刷新不能把它们冲掉）。
    pub async fn refresh_conversations(&self) -> Result<()> {
        match self.api.list_conversations().await {
            Ok(mut remote) => {
                let mut superseded: Vec<(String, String)> = Vec::new();
                {
                    let current = self.conversations.read().await;
                    for c in current.iter().filter(|c| c.local_only) {
                        match remote
                            .iter()
                            .find(|r| r.is_between(c.student.id, c.tutor.id))
                        {
                            // 本地兜底会话被服务端权威会话取代
                            Some(canonical) => {
                                superseded.push((c.id.clone(), canonical.id.clone()))
                            }
                            None => remote.push(c.clone()),
                        }
                    }
                }
                for (local_id, canonical_id) in superseded {
                    self.adopt_canonical_conversation(&local_id, &canonical_id)
                        .await;
                }
                remote.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                if let Err(e) = self
                    .cache
                    .save_conversations(self.config.user_id, &remote)
                    .await
                {
                    warn!("[Store] ⚠️ 会话列表缓存写入失败: {}", e);
                }
                let payload = serde_json::to_string(&remote).unwrap_or_default();
                *self.conversations.write().await = remote;
                self.listener.on_conversation_list_changed(payload).await;
                Ok(())
            }
            Err(e) if e.downcast_ref::<ChatError>().map_or(false, |c| {
                matches!(c, ChatError::EndpointExhausted { .. })
            }) =>
            {
                warn!("[Store] ⚠️ 会话列表端点耗尽，回退本地缓存: {}", e);
                let cached = self.cache.load_conversations(self.config.user_id).await?;
                if !cached.is_empty() {
                    let payload = serde_json::to_string(&cached).unwrap_or_default();
                    *self.conversations.write().await = cached;
                    self.listener.on_conversation_list_changed(payload).await;
                }
                self.listener.on_offline("conversations".to_string()).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 解析或创建与 `peer` 的会话
    ///
    /// 配对匹配与参与者顺序无关：同一对用户永远解析到同一个会话。
    /// 服务端创建失败时合成仅本地会话，聊天流程不被阻断。
    pub async fn resolve_or_create(&self, peer: &UserRef) -> Result<ResolveOutcome> {
        if peer.id <= 0 {
            return Err(ChatError::InvalidParticipant(format!(
                "无效的对端用户 ID: {}",
                peer.id
            ))
            .into());
        }
        if peer.id == self.config.user_id {
            return Err(
                ChatError::InvalidParticipant("不能与自己创建会话".to_string()).into(),
            );
        }

        // 先查本地列表
        {
            let list = self.conversations.read().await;
            if let Some(c) = list
                .iter()
                .find(|c| c.is_between(self.config.user_id, peer.id))
            {
                info!("[Store] 📎 复用已有会话 (conversationID={})", c.id);
                return Ok(ResolveOutcome::Found(c.clone()));
            }
        }

        // 服务端创建
        match self
            .api
            .create_conversation(self.config.user_id, peer.id)
            .await
        {
            Ok(conversation) => {
                info!(
                    "[Store] ✅ 服务端创建会话成功 (conversationID={})",
                    conversation.id
                );
                self.install_conversation(conversation.clone()).await;
                Ok(ResolveOutcome::Created(conversation))
            }
            Err(e) => {
                warn!("[Store] ⚠️ 服务端创建失败，合成本地会话: {}", e);
                let conversation = Conversation {
                    id: generate_local_id("local"),
                    student: UserRef::new(self.config.user_id, ""),
                    tutor: peer.clone(),
                    last_message: String::new(),
                    updated_at: now_millis(),
                    unread_count: 0,
                    local_only: true,
                };
                self.install_conversation(conversation.clone()).await;
                self.listener.on_offline("conversations".to_string()).await;
                Ok(ResolveOutcome::LocalOnly(conversation))
            }
        }
    }

    /// 本地兜底会话被服务端权威会话取代
    ///
    /// 临时 ID 永久登记为查询别名；旧缓存键下未发出的 localOnly
    /// 消息随之迁往权威键——未发出的消息不允许从视图中消失。
    async fn adopt_canonical_conversation(&self, local_id: &str, canonical_id: &str) {
        self.aliases
            .write()
            .await
            .insert(local_id.to_string(), canonical_id.to_string());
        match self
            .cache
            .migrate_local_messages(local_id, canonical_id)
            .await
        {
            Ok(0) => {}
            Ok(moved) => info!(
                "[Store] 📦 已迁移 {} 条本地消息 ({} -> {})",
                moved, local_id, canonical_id
            ),
            Err(e) => warn!(
                "[Store] ⚠️ 本地消息迁移失败 ({} -> {}): {}",
                local_id, canonical_id, e
            ),
        }
    }

    async fn install_conversation(&self, conversation: Conversation) {
        let snapshot;
        {
            let mut list = self.conversations.write().await;
            if !list.iter().any(|c| c.id == conversation.id) {
                list.insert(0, conversation);
            }
            snapshot = list.clone();
        }
        if let Err(e) = self
            .cache
            .save_conversations(self.config.user_id, &snapshot)
            .await
        {
            warn!("[Store] ⚠️ 会话列表缓存写入失败: {}", e);
        }
        let payload = serde_json::to_string(&snapshot).unwrap_or_default();
        self.listener.on_conversation_list_changed(payload).await;
    }

    /// 打开会话：切换活动会话、订阅实时消息并加载第一页
    ///
    /// 先写入活动会话 ID 再发起加载，首页返回后用它做过期守卫：
    /// 用户在加载途中又切走时，迟到的结果直接丢弃。
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let resolved = self.canonical_id(conversation_id).await;
        let conversation_id = resolved.as_str();
        info!("[Store] 📂 打开会话 (conversationID={})", conversation_id);
        {
            *self.active.id.write().await = Some(conversation_id.to_string());
            self.active.messages.write().await.clear();
        }

        let router = Arc::new(InboundRouter {
            active: self.active.clone(),
            cache: self.cache.clone(),
            listener: self.listener.clone(),
        });
        self.transport.subscribe(conversation_id, router).await?;

        let page = self.paginator.load_first_page(conversation_id).await?;

        // 过期守卫
        if self.active.id.read().await.as_deref() != Some(conversation_id) {
            debug!(
                "[Store] 首页结果迟到，活动会话已切换 (conversationID={})",
                conversation_id
            );
            return Ok(Vec::new());
        }

        let snapshot;
        {
            let mut msgs = self.active.messages.write().await;
            reconcile::merge_page(&mut msgs, page.messages);
            snapshot = msgs.clone();
        }

        if page.from_cache {
            self.listener.on_offline("messages".to_string()).await;
        } else if let Err(e) = self.cache.save_messages(conversation_id, &snapshot).await {
            warn!("[Store] ⚠️ 消息缓存写入失败: {}", e);
        }

        self.zero_unread(conversation_id).await;
        Ok(snapshot)
    }

    /// 关闭当前活动会话（退订并清空视图）
    pub async fn close_conversation(&self) {
        let previous = self.active.id.write().await.take();
        self.active.messages.write().await.clear();
        if let Some(id) = previous {
            self.transport.unsubscribe(&id).await;
        }
    }

    /// 发送消息：乐观展示 Pending，再按投递结果调和
    pub async fn send_message(&self, content: &str) -> Result<Message> {
        let conversation_id = self
            .active
            .id
            .read()
            .await
            .clone()
            .ok_or(ChatError::NoActiveConversation)?;
        let receiver_id = {
            let list = self.conversations.read().await;
            list.iter()
                .find(|c| c.id == conversation_id)
                .map(|c| c.peer_of(self.config.user_id).id)
        };
        // 接收方不明的消息不允许发往服务器
        let Some(receiver_id) = receiver_id else {
            return Err(ChatError::InvalidParticipant(format!(
                "会话 {} 不在本地列表中，无法确定接收方",
                conversation_id
            ))
            .into());
        };

        let message = Message {
            id: generate_local_id("msg"),
            conversation_id: conversation_id.clone(),
            sender_id: self.config.user_id,
            receiver_id,
            content: content.to_string(),
            timestamp: now_millis(),
            delivery_state: DeliveryState::Pending,
            is_read: false,
        };

        // 乐观展示
        {
            let mut msgs = self.active.messages.write().await;
            reconcile::merge(&mut msgs, message.clone());
        }
        self.listener
            .on_new_message(serde_json::to_string(&message).unwrap_or_default())
            .await;

        let outcome = self.transport.send(message).await?;
        let final_message = outcome.message.clone();

        let snapshot;
        {
            let mut msgs = self.active.messages.write().await;
            reconcile::merge(&mut msgs, outcome.message);
            snapshot = msgs.clone();
        }
        if let Err(e) = self.cache.save_messages(&conversation_id, &snapshot).await {
            warn!("[Store] ⚠️ 消息缓存写入失败: {}", e);
        }

        self.touch_conversation(&conversation_id, &final_message.content)
            .await;
        self.listener
            .on_message_state_changed(serde_json::to_string(&final_message).unwrap_or_default())
            .await;
        Ok(final_message)
    }

    /// 向更早方向加载下一页，返回实际追加的条数
    pub async fn load_older_messages(&self) -> Result<usize> {
        let conversation_id = self
            .active
            .id
            .read()
            .await
            .clone()
            .ok_or(ChatError::NoActiveConversation)?;

        let page = self.paginator.load_next_page(&conversation_id).await?;

        // 过期守卫
        if self.active.id.read().await.as_deref() != Some(conversation_id.as_str()) {
            return Ok(0);
        }

        let appended;
        let snapshot;
        {
            let mut msgs = self.active.messages.write().await;
            appended = reconcile::merge_page(&mut msgs, page.messages);
            snapshot = msgs.clone();
        }
        if appended > 0 {
            if let Err(e) = self.cache.save_messages(&conversation_id, &snapshot).await {
                warn!("[Store] ⚠️ 消息缓存写入失败: {}", e);
            }
        }
        Ok(appended)
    }

    /// 把当前活动会话标记为已读
    ///
    /// 本地标记立即生效；服务端回执按条后台发出，失败只记日志。
    pub async fn mark_conversation_read(&self) -> Result<()> {
        let conversation_id = self
            .active
            .id
            .read()
            .await
            .clone()
            .ok_or(ChatError::NoActiveConversation)?;

        let snapshot;
        {
            let mut msgs = self.active.messages.write().await;
            for m in msgs.iter_mut() {
                if m.receiver_id == self.config.user_id && !m.is_read {
                    m.is_read = true;
                    if m.delivery_state == DeliveryState::ConfirmedServer {
                        self.transport.mark_read(&m.id);
                    }
                }
            }
            snapshot = msgs.clone();
        }
        if let Err(e) = self.cache.save_messages(&conversation_id, &snapshot).await {
            warn!("[Store] ⚠️ 消息缓存写入失败: {}", e);
        }

        self.zero_unread(&conversation_id).await;
        Ok(())
    }

    async fn zero_unread(&self, conversation_id: &str) {
        let total;
        {
            let mut list = self.conversations.write().await;
            if let Some(c) = list.iter_mut().find(|c| c.id == conversation_id) {
                c.unread_count = 0;
            }
            total = list.iter().map(|c| c.unread_count).sum();
        }
        self.listener.on_unread_count_changed(total).await;
    }

    async fn touch_conversation(&self, conversation_id: &str, preview: &str) {
        let mut list = self.conversations.write().await;
        if let Some(c) = list.iter_mut().find(|c| c.id == conversation_id) {
            c.last_message = preview.to_string();
            c.updated_at = now_millis();
        }
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    /// 把（可能是临时的）会话 ID 解析为权威 ID
    ///
    /// 别名链不嵌套：临时 ID 只会指向服务端 ID，一跳即达。
    pub async fn canonical_id(&self, conversation_id: &str) -> String {
        self.aliases
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| conversation_id.to_string())
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.conversations.read().await.clone()
    }

    pub async fn active_conversation_id(&self) -> Option<String> {
        self.active.id.read().await.clone()
    }

    pub async fn active_messages(&self) -> Vec<Message> {
        self.active.messages.read().await.clone()
    }

    pub async fn total_unread(&self) -> i32 {
        self.conversations
            .read()
            .await
            .iter()
            .map(|c| c.unread_count)
            .sum()
    }

    #[cfg(test)]
    async fn seed_conversation(&self, conversation: Conversation) {
        self.conversations.write().await.push(conversation);
    }
}
