//! 传输层：推送通道 + 轮询降级
//!
//! 推送经 WebSocket（订阅/退订控制帧 + 服务端 JSON 事件），连接失败时
//! 降级为固定间隔的轮询任务。两种模式在 connect 时二选一，重连时重新
//! 评估。每个逻辑"活动槽"同一时刻至多一个订阅：切换会话必须先结清
//! 旧订阅再建立新订阅，否则 A 会话的消息可能投进 B 会话的视图。
//!
//! 入站投递是 at-least-once，去重交给下游的投递调和器。

use crate::chat::api::ChatApi;
use crate::chat::cache::LocalCache;
use crate::chat::error::ChatError;
use crate::chat::listener::ChatListener;
use crate::chat::types::{DeliveryState, Message, MessageRecord};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 心跳间隔（秒）
const HEARTBEAT_SECS: u64 = 25;

/// 轮询降级模式的固定间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// 会话内的传输模式（connect 时选定，二者互斥）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Push,
    Poll,
}

/// 投递结果：到达服务器，或降级落入本地缓存
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    Server,
    Local,
}

/// 发送结果（消息绝不丢失，降级也向 UI 报告成功）
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub delivered: Delivered,
    pub message: Message,
}

/// 入站消息处理器（由 ConversationStore 实现）
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_inbound(&self, message: Message);
}

/// 订阅句柄
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub conversation_id: String,
}

struct Subscription {
    conversation_id: String,
    handler: Arc<dyn InboundHandler>,
}

struct ConnState {
    connected: bool,
    connecting: bool,
    mode: Option<TransportMode>,
    writer: Option<Arc<Mutex<WsWriter>>>,
    tasks: Vec<tokio::task::AbortHandle>,
}

/// 传输会话
pub struct Transport {
    user_id: i64,
    token: String,
    ws_url: String,
    poll_interval: Duration,
    api: Arc<ChatApi>,
    cache: Arc<LocalCache>,
    listener: Arc<dyn ChatListener>,
    state: Arc<Mutex<ConnState>>,
    subscription: Arc<Mutex<Option<Subscription>>>,
}

impl Transport {
    pub fn new(
        user_id: i64,
        token: String,
        ws_url: String,
        api: Arc<ChatApi>,
        cache: Arc<LocalCache>,
        listener: Arc<dyn ChatListener>,
    ) -> Self {
        Self {
            user_id,
            token,
            ws_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            api,
            cache,
            listener,
            state: Arc::new(Mutex::new(ConnState {
                connected: false,
                connecting: false,
                mode: None,
                writer: None,
                tasks: Vec::new(),
            })),
            subscription: Arc::new(Mutex::new(None)),
        }
    }

    fn build_url(&self) -> String {
        format!(
            "{}/ws/chat?userId={}&token={}",
            self.ws_url, self.user_id, self.token
        )
    }

    /// 建立传输会话（幂等：已连接或连接中时为空操作）
    ///
    /// 推送通道建不起来不是硬错误：切换到轮询降级模式并通过监听器
    /// 上报 `on_transport_degraded`，connect 本身仍然成功。
    pub async fn connect(&self) -> Result<()> {
        {
            let mut st = self.state.lock().await;
            if st.connected || st.connecting {
                info!("[Transport] 已连接或连接中，忽略重复 connect");
                return Ok(());
            }
            st.connecting = true;
        }

        let url = self.build_url();
        info!("[Transport] 🔗 连接推送通道 (user={})", self.user_id);

        match connect_async(&url).await {
            Ok((ws_stream, response)) => {
                info!(
                    "[Transport] ✅ WebSocket 连接成功, 状态: {}",
                    response.status()
                );
                let (write, read) = ws_stream.split();
                let writer = Arc::new(Mutex::new(write));

                // 读取循环：解析服务端 JSON 事件并路由到活动订阅
                let sub = self.subscription.clone();
                let reader_task = tokio::spawn(Self::read_loop(read, sub));

                // 心跳
                let hb_writer = writer.clone();
                let heartbeat_task = tokio::spawn(async move {
                    let mut ticker = interval(Duration::from_secs(HEARTBEAT_SECS));
                    loop {
                        ticker.tick().await;
                        let mut w = hb_writer.lock().await;
                        if w.send(WsMessage::Ping(vec![])).await.is_err() {
                            break;
                        }
                    }
                });

                let mut st = self.state.lock().await;
                st.writer = Some(writer);
                st.tasks = vec![reader_task.abort_handle(), heartbeat_task.abort_handle()];
                st.mode = Some(TransportMode::Push);
                st.connected = true;
                st.connecting = false;
                drop(st);

                self.listener.on_connected(true).await;
            }
            Err(e) => {
                let err = ChatError::TransportUnavailable(e.to_string());
                warn!("[Transport] ⚠️ {}，切换到轮询降级模式", err);

                // 轮询任务归会话所有，disconnect 时确定性停止
                let api = self.api.clone();
                let sub = self.subscription.clone();
                let poll = self.poll_interval;
                let poll_task = tokio::spawn(Self::poll_loop(api, sub, poll));

                let mut st = self.state.lock().await;
                st.writer = None;
                st.tasks = vec![poll_task.abort_handle()];
                st.mode = Some(TransportMode::Poll);
                st.connected = true;
                st.connecting = false;
                drop(st);

                self.listener.on_transport_degraded(err.to_string()).await;
                self.listener.on_connected(false).await;
            }
        }

        Ok(())
    }

    /// 断开会话：停掉所有后台任务、清空订阅
    pub async fn disconnect(&self) {
        let mut st = self.state.lock().await;
        for task in st.tasks.drain(..) {
            task.abort();
        }
        st.writer = None;
        st.mode = None;
        st.connected = false;
        st.connecting = false;
        drop(st);

        self.subscription.lock().await.take();
        info!("[Transport] 👋 会话已断开");
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    pub async fn mode(&self) -> Option<TransportMode> {
        self.state.lock().await.mode
    }

    /// 当前订阅的会话 ID（至多一个）
    pub async fn subscribed_conversation(&self) -> Option<String> {
        self.subscription
            .lock()
            .await
            .as_ref()
            .map(|s| s.conversation_id.clone())
    }

    /// 订阅会话的实时消息
    ///
    /// 硬性顺序要求：存在旧订阅时，必须先结清旧会话的退订，再建立
    /// 新订阅——UI 假定同一时刻只有一个会话接收实时更新。
    pub async fn subscribe(
        &self,
        conversation_id: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<SubscriptionHandle> {
        let prev = self.subscription.lock().await.take();
        if let Some(prev) = prev {
            if prev.conversation_id != conversation_id {
                info!(
                    "[Transport] 🔀 订阅切换: {} -> {}",
                    prev.conversation_id, conversation_id
                );
                self.send_control("unsubscribe", &prev.conversation_id).await;
            }
        }

        self.send_control("subscribe", conversation_id).await;
        *self.subscription.lock().await = Some(Subscription {
            conversation_id: conversation_id.to_string(),
            handler,
        });
        debug!("[Transport] 📌 已订阅会话 {}", conversation_id);
        Ok(SubscriptionHandle {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// 退订会话（与当前订阅不匹配时为空操作）
    pub async fn unsubscribe(&self, conversation_id: &str) {
        let removed = {
            let mut sub = self.subscription.lock().await;
            if sub
                .as_ref()
                .map(|s| s.conversation_id == conversation_id)
                .unwrap_or(false)
            {
                sub.take();
                true
            } else {
                false
            }
        };
        if removed {
            self.send_control("unsubscribe", conversation_id).await;
            debug!("[Transport] 📍 已退订会话 {}", conversation_id);
        }
    }

    /// 发送消息
    ///
    /// 失败时绝不丢弃：以 localOnly 状态写入本地缓存，并仍向 UI
    /// 报告成功（投递结果为 `Delivered::Local`）。
    pub async fn send(&self, mut message: Message) -> Result<SendOutcome> {
        match self.api.send_message(&message).await {
            Ok(confirmed) => Ok(SendOutcome {
                delivered: Delivered::Server,
                message: confirmed,
            }),
            Err(e) => {
                warn!(
                    "[Transport] ⚠️ {}，消息转入本地缓存",
                    ChatError::SendFailed(e.to_string())
                );
                message.delivery_state = DeliveryState::LocalOnly;
                self.cache.append_message(&message).await?;
                Ok(SendOutcome {
                    delivered: Delivered::Local,
                    message,
                })
            }
        }
    }

    /// 标记消息已读（fire-and-forget：后台发出，错误只记日志）
    pub fn mark_read(&self, message_id: &str) {
        let api = self.api.clone();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = api.mark_read(&message_id).await {
                debug!("[Transport] 已读回执发送失败 (messageID={}): {}", message_id, e);
            }
        });
    }

    /// 推送模式下向服务端发控制帧；轮询模式或未连接时为空操作
    async fn send_control(&self, action: &str, conversation_id: &str) {
        let writer = self.state.lock().await.writer.clone();
        if let Some(writer) = writer {
            let frame = serde_json::json!({
                "action": action,
                "conversationId": conversation_id,
            })
            .to_string();
            let mut w = writer.lock().await;
            if let Err(e) = w.send(WsMessage::Text(frame)).await {
                warn!("[Transport] ⚠️ 控制帧发送失败 ({}): {}", action, e);
            }
        }
    }

    /// WebSocket 读取循环（事件循环，连接断开即退出）
    async fn read_loop(mut read: WsReader, subscription: Arc<Mutex<Option<Subscription>>>) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    if let Some(msg) = Self::parse_inbound(&text) {
                        Self::route_inbound(&subscription, msg).await;
                    } else {
                        debug!("[Transport] 忽略不可识别的推送帧: {}", text);
                    }
                }
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(frame)) => {
                    warn!("[Transport] 👋 推送通道关闭: {:?}", frame);
                    break;
                }
                Err(e) => {
                    error!("[Transport] WebSocket 错误: {}", e);
                    break;
                }
                _ => {}
            }
        }
    }

    /// 轮询降级循环：固定间隔拉取当前订阅会话的首页消息
    ///
    /// 重复投递是预期行为，由下游调和器收拢。
    async fn poll_loop(
        api: Arc<ChatApi>,
        subscription: Arc<Mutex<Option<Subscription>>>,
        poll_interval: Duration,
    ) {
        let mut ticker = interval(poll_interval);
        loop {
            ticker.tick().await;
            let target = subscription
                .lock()
                .await
                .as_ref()
                .map(|s| s.conversation_id.clone());
            let Some(conversation_id) = target else {
                continue;
            };
            match api.fetch_messages(&conversation_id, 0).await {
                Ok(page) => {
                    for msg in page.messages {
                        Self::route_inbound(&subscription, msg).await;
                    }
                }
                Err(e) => {
                    debug!(
                        "[Transport] 轮询拉取失败 (conversationID={}): {}",
                        conversation_id, e
                    );
                }
            }
        }
    }

    /// 解析推送事件：裸消息对象或 `{"payload": {...}}` 信封
    fn parse_inbound(text: &str) -> Option<Message> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let body = value.get("payload").unwrap_or(&value);
        serde_json::from_value::<MessageRecord>(body.clone())
            .ok()
            .and_then(MessageRecord::into_message)
    }

    /// 入站路由：会话 ID 与活动订阅不符的事件直接丢弃
    /// （过期/串台守卫——退订结清之前绝不会把 A 的消息投给 B）
    async fn route_inbound(subscription: &Mutex<Option<Subscription>>, message: Message) {
        let sub = subscription.lock().await;
        match sub.as_ref() {
            Some(s) if s.conversation_id == message.conversation_id => {
                let handler = s.handler.clone();
                drop(sub);
                handler.on_inbound(message).await;
            }
            _ => {
                debug!(
                    "[Transport] 丢弃非活动会话的入站消息 (conversationID={})",
                    message.conversation_id
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn dispatch_for_test(&self, message: Message) {
        Self::route_inbound(&self.subscription, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::listener::EmptyChatListener;
    use crate::chat::types::now_millis;
    use std::sync::Once;

    static INIT_LOGGER: Once = Once::new();

    fn init_test_logger() {
        INIT_LOGGER.call_once(|| {
            use tracing_subscriber::prelude::*;
            use tracing_subscriber::EnvFilter;

            // 测试中默认打开当前 crate 和 sqlx 的 debug，关闭底层 HTTP 客户端的 debug 噪音
            let filter_layer = EnvFilter::new(
                "info,tutorlink_chat_core=debug,sqlx=debug,hyper_util::client=info,reqwest=info",
            );

            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(false)
                .with_test_writer();

            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .init();
        });
    }

    /// 指向必然拒绝连接的端口：发送必定走 localOnly 兜底
    async fn offline_transport() -> (Transport, Arc<LocalCache>) {
        init_test_logger();
        let api = Arc::new(ChatApi::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9".to_string(),
            1,
        ));
        let cache = Arc::new(LocalCache::new("sqlite::memory:").await.unwrap());
        let transport = Transport::new(
            1,
            "token".to_string(),
            "ws://127.0.0.1:9".to_string(),
            api,
            cache.clone(),
            Arc::new(EmptyChatListener),
        );
        (transport, cache)
    }

    fn msg(conversation_id: &str, content: &str) -> Message {
        Message {
            id: crate::chat::types::generate_local_id("msg"),
            conversation_id: conversation_id.to_string(),
            sender_id: 1,
            receiver_id: 2,
            content: content.to_string(),
            timestamp: now_millis(),
            delivery_state: DeliveryState::Pending,
            is_read: false,
        }
    }

    struct Recorder {
        seen: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn on_inbound(&self, message: Message) {
            self.seen.lock().await.push(message);
        }
    }

    #[tokio::test]
    async fn test_send_failure_degrades_to_local_only() {
        let (transport, cache) = offline_transport().await;
        let outcome = transport.send(msg("c1", "hi")).await.unwrap();

        // 向 UI 报告降级成功，消息绝不静默丢失
        assert_eq!(outcome.delivered, Delivered::Local);
        assert_eq!(outcome.message.delivery_state, DeliveryState::LocalOnly);

        let cached = cache.load_messages("c1").await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].delivery_state, DeliveryState::LocalOnly);
        assert_eq!(cached[0].content, "hi");
    }

    #[tokio::test]
    async fn test_subscription_handoff_leaves_single_subscription() {
        let (transport, _cache) = offline_transport().await;
        let recorder_a = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let recorder_b = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });

        transport.subscribe("c1", recorder_a.clone()).await.unwrap();
        transport.subscribe("c2", recorder_b.clone()).await.unwrap();

        assert_eq!(
            transport.subscribed_conversation().await,
            Some("c2".to_string())
        );

        // c1 的消息切换后绝不能投进 c2 的处理器
        transport.dispatch_for_test(msg("c1", "stale")).await;
        transport.dispatch_for_test(msg("c2", "live")).await;

        assert!(recorder_a.seen.lock().await.is_empty());
        let seen_b = recorder_b.seen.lock().await;
        assert_eq!(seen_b.len(), 1);
        assert_eq!(seen_b[0].conversation_id, "c2");
    }

    #[tokio::test]
    async fn test_unsubscribe_mismatch_is_noop() {
        let (transport, _cache) = offline_transport().await;
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        transport.subscribe("c1", recorder).await.unwrap();
        transport.unsubscribe("c9").await;
        assert_eq!(
            transport.subscribed_conversation().await,
            Some("c1".to_string())
        );
        transport.unsubscribe("c1").await;
        assert_eq!(transport.subscribed_conversation().await, None);
    }
}
