//! REST 端点解析器
//!
//! 后端同一逻辑操作存在多个形状不一的候选端点。每个操作维护一个
//! 按优先级排序的候选清单，依次尝试，第一个解析出可识别结构的响应
//! 获胜；全部失败则报告 `EndpointExhausted`，由调用方回退到本地缓存。
//! 失败永远向上报告，绝不静默吞掉。

use crate::chat::error::ChatError;
use crate::chat::types::{Conversation, ConversationRecord, Message, MessageRecord};
use anyhow::{Context, Result};
use serde_json::Value;
use std::future::Future;
use tracing::{debug, info, warn};

/// 固定分页大小
pub const PAGE_SIZE: u32 = 20;

/// 一页消息及"是否还有更早页"标记
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// 候选端点梯子的通用执行器
///
/// 按序执行 `attempt(0..total)`：`Ok(Some(v))` 即获胜返回；
/// `Ok(None)`（结构不可识别或空）与 `Err` 都落到下一个候选。
/// 恰好尝试 `total` 次后以 `EndpointExhausted` 终止，绝不无限重试。
pub(crate) async fn resolve_first<T, F, Fut>(op: &str, total: usize, mut attempt: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for i in 0..total {
        match attempt(i).await {
            Ok(Some(v)) => {
                debug!("[ChatAPI] ✅ {} 第 {}/{} 个候选端点命中", op, i + 1, total);
                return Ok(v);
            }
            Ok(None) => {
                warn!(
                    "[ChatAPI] ⚠️ {} 第 {}/{} 个候选端点返回空或不可识别的结构",
                    op,
                    i + 1,
                    total
                );
            }
            Err(e) => {
                warn!(
                    "[ChatAPI] ⚠️ {} 第 {}/{} 个候选端点失败: {}",
                    op,
                    i + 1,
                    total,
                    e
                );
            }
        }
    }
    Err(ChatError::EndpointExhausted { attempts: total }.into())
}

/// 把各种包装形状归一为一个记录序列
///
/// 接受：裸数组、`{"content": [...]}` 分页包装、`{"conversations": [...]}`
/// 包装、以及再套一层 `{"data": ...}` 信封的以上任意形态。
pub(crate) fn normalize_records(value: &Value) -> Option<Vec<Value>> {
    if let Some(arr) = value.as_array() {
        return Some(arr.clone());
    }
    for key in ["content", "conversations", "messages"] {
        if let Some(arr) = value.get(key).and_then(Value::as_array) {
            return Some(arr.clone());
        }
    }
    if let Some(inner) = value.get("data") {
        return normalize_records(inner);
    }
    None
}

/// 从分页包装推断是否还有更早的页
fn page_has_more(value: &Value, got: usize) -> bool {
    if let Some(last) = value.get("last").and_then(Value::as_bool) {
        return !last;
    }
    got as u32 >= PAGE_SIZE
}

fn parse_conversations(records: Vec<Value>) -> Vec<Conversation> {
    records
        .into_iter()
        .filter_map(|v| serde_json::from_value::<ConversationRecord>(v).ok())
        .filter_map(ConversationRecord::into_conversation)
        .collect()
}

fn parse_messages(records: Vec<Value>) -> Vec<Message> {
    records
        .into_iter()
        .filter_map(|v| serde_json::from_value::<MessageRecord>(v).ok())
        .filter_map(MessageRecord::into_message)
        .collect()
}

/// 从响应体解析一页消息；`None` 表示结构不可识别（落到下一个候选）
///
/// `{"content": []}` 的空分页包装是明确的"到底了"信号，不算不可识别。
/// hasMore 按原始记录条数判断：脏记录会在解析时被丢弃，不能因为
/// 整页里混了一条脏数据就把分页提前钉死。
fn parse_message_page(value: &Value, page_size: u32) -> Option<MessagePage> {
    if let Some(content) = value.get("content").and_then(Value::as_array) {
        let raw_count = content.len();
        let messages = parse_messages(content.clone());
        let has_more = raw_count > 0 && page_has_more(value, raw_count);
        return Some(MessagePage { messages, has_more });
    }
    let records = normalize_records(value)?;
    let raw_count = records.len();
    let messages = parse_messages(records);
    if messages.is_empty() {
        return None;
    }
    let has_more = raw_count as u32 >= page_size;
    Some(MessagePage { messages, has_more })
}

/// 单个对象形态的会话响应（创建接口返回）
fn parse_conversation_object(value: &Value) -> Option<Conversation> {
    if let Ok(rec) = serde_json::from_value::<ConversationRecord>(value.clone()) {
        if let Some(conv) = rec.into_conversation() {
            return Some(conv);
        }
    }
    for key in ["conversation", "data"] {
        if let Some(inner) = value.get(key) {
            if let Some(conv) = parse_conversation_object(inner) {
                return Some(conv);
            }
        }
    }
    None
}

async fn read_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body = resp.text().await.context("读取响应失败")?;
    if !status.is_success() {
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, body));
    }
    serde_json::from_str(&body).context("解析 JSON 失败")
}

/// 聊天 REST API 客户端
///
/// `client` 应在外部配好认证头（token 通过 default_headers 自动附带）。
pub struct ChatApi {
    client: reqwest::Client,
    api_base_url: String,
    user_id: i64,
}

impl ChatApi {
    pub fn new(client: reqwest::Client, api_base_url: String, user_id: i64) -> Self {
        Self {
            client,
            api_base_url,
            user_id,
        }
    }

    /// 拉取会话列表（三级候选梯子，末级为全量列表 + 客户端过滤）
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let candidates = [
            format!("{}/conversations/user/{}", self.api_base_url, self.user_id),
            format!("{}/conversations/findByUser/{}", self.api_base_url, self.user_id),
            format!("{}/conversations", self.api_base_url),
        ];
        let user_id = self.user_id;

        info!("[ChatAPI] 📡 请求会话列表 (user={})", user_id);
        resolve_first("会话列表", candidates.len(), |i| {
            let client = self.client.clone();
            let url = candidates[i].clone();
            let needs_filter = i == candidates.len() - 1;
            async move {
                let resp = client.get(&url).send().await.context("请求失败")?;
                let value = read_json(resp).await?;
                let Some(records) = normalize_records(&value) else {
                    return Ok(None);
                };
                let mut list = parse_conversations(records);
                if needs_filter {
                    list.retain(|c| c.student.id == user_id || c.tutor.id == user_id);
                }
                if list.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(list))
                }
            }
        })
        .await
    }

    /// 创建会话（两种请求体拼写 + 路径参数形式的创建梯子）
    pub async fn create_conversation(
        &self,
        student_id: i64,
        tutor_id: i64,
    ) -> Result<Conversation> {
        let base = self.api_base_url.clone();

        info!(
            "[ChatAPI] 📡 请求创建会话 (student={}, tutor={})",
            student_id, tutor_id
        );
        resolve_first("创建会话", 3, |i| {
            let client = self.client.clone();
            let base = base.clone();
            async move {
                let req = match i {
                    0 => client
                        .post(format!("{}/conversations", base))
                        .json(&serde_json::json!({
                            "studentId": student_id,
                            "tutorId": tutor_id,
                        })),
                    1 => client
                        .post(format!("{}/conversations", base))
                        .json(&serde_json::json!({
                            "user1Id": student_id,
                            "user2Id": tutor_id,
                        })),
                    _ => client.post(format!(
                        "{}/conversations/create/{}/{}",
                        base, student_id, tutor_id
                    )),
                };
                let resp = req.send().await.context("请求失败")?;
                let value = read_json(resp).await?;
                Ok(parse_conversation_object(&value))
            }
        })
        .await
    }

    /// 拉取会话消息（向更早方向分页，page 从 0 开始）
    ///
    /// `{"content": []}` 的空分页包装是可识别的"到底了"信号，
    /// 返回空页而不落到下一个候选；裸空数组则视为不可识别。
    pub async fn fetch_messages(&self, conversation_id: &str, page: u32) -> Result<MessagePage> {
        let candidates = [
            format!(
                "{}/conversations/{}/messages?page={}&size={}",
                self.api_base_url, conversation_id, page, PAGE_SIZE
            ),
            format!(
                "{}/messages/conversation/{}?page={}&size={}",
                self.api_base_url, conversation_id, page, PAGE_SIZE
            ),
        ];

        debug!(
            "[ChatAPI] 📡 请求消息分页 (conversationID={}, page={})",
            conversation_id, page
        );
        resolve_first("消息分页", candidates.len(), |i| {
            let client = self.client.clone();
            let url = candidates[i].clone();
            async move {
                let resp = client.get(&url).send().await.context("请求失败")?;
                let value = read_json(resp).await?;
                Ok(parse_message_page(&value, PAGE_SIZE))
            }
        })
        .await
    }

    /// 发送消息（单一路径，失败由传输层转为 localOnly 兜底）
    pub async fn send_message(&self, message: &Message) -> Result<Message> {
        let url = format!("{}/messages", self.api_base_url);
        debug!(
            "[ChatAPI] 📡 发送消息 (conversationID={}, 长度={})",
            message.conversation_id,
            message.content.len()
        );

        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "conversationId": message.conversation_id,
                "senderId": message.sender_id,
                "receiverId": message.receiver_id,
                "content": message.content,
            }))
            .send()
            .await
            .context("请求失败")?;
        let value = read_json(resp).await?;

        // 服务端回显：采纳服务端 ID 与时间戳；回显体解析不了但状态码
        // 成功时，退一步保留本地 ID 按已确认处理
        let confirmed = serde_json::from_value::<MessageRecord>(value.clone())
            .ok()
            .and_then(MessageRecord::into_message)
            .unwrap_or_else(|| {
                let mut m = message.clone();
                m.delivery_state = crate::chat::types::DeliveryState::ConfirmedServer;
                m
            });
        info!(
            "[ChatAPI] ✅ 消息已送达服务器 (id={} -> {})",
            message.id, confirmed.id
        );
        Ok(confirmed)
    }

    /// 标记消息已读（fire-and-forget 通知，调用方不等待结果）
    pub async fn mark_read(&self, message_id: &str) -> Result<()> {
        let url = format!("{}/messages/{}/read", self.api_base_url, message_id);
        let resp = self.client.patch(&url).send().await.context("请求失败")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("HTTP 错误 {}", status));
        }
        debug!("[ChatAPI] ✅ 已读回执已发送 (messageID={})", message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_ladder_terminates_after_exactly_n_attempts() {
        let attempts = AtomicUsize::new(0);
        let result: Result<()> = resolve_first("测试", 4, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("模拟失败")) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        let err = result.unwrap_err();
        match err.downcast_ref::<ChatError>() {
            Some(ChatError::EndpointExhausted { attempts }) => assert_eq!(*attempts, 4),
            other => panic!("期望 EndpointExhausted，得到 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ladder_stops_at_first_success() {
        let attempts = AtomicUsize::new(0);
        let result = resolve_first("测试", 3, |i| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if i == 1 {
                    Ok(Some(42))
                } else {
                    Ok(None)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_normalize_accepts_all_wrapper_shapes() {
        let bare = serde_json::json!([{"id": 1}]);
        let page = serde_json::json!({"content": [{"id": 1}], "last": false});
        let wrapped = serde_json::json!({"conversations": [{"id": 1}]});
        let envelope = serde_json::json!({"data": {"content": [{"id": 1}]}});
        for v in [bare, page, wrapped, envelope] {
            let records = normalize_records(&v).expect("应可识别");
            assert_eq!(records.len(), 1);
        }
        assert!(normalize_records(&serde_json::json!({"foo": 1})).is_none());
    }

    #[test]
    fn test_page_has_more_prefers_last_flag() {
        let v = serde_json::json!({"content": [], "last": true});
        assert!(!page_has_more(&v, PAGE_SIZE as usize));
        let v = serde_json::json!({"content": [], "last": false});
        assert!(page_has_more(&v, 0));
        // 没有 last 标记时退化为"整页即可能还有"
        let v = serde_json::json!({"content": []});
        assert!(page_has_more(&v, PAGE_SIZE as usize));
        assert!(!page_has_more(&v, 3));
    }

    #[test]
    fn test_page_has_more_counts_raw_records() {
        let mut records: Vec<Value> = (0..PAGE_SIZE as i64 - 1)
            .map(|i| serde_json::json!({"id": i, "conversationId": 7, "content": "x"}))
            .collect();
        records.push(serde_json::json!({"bogus": true}));

        // 整页 20 条里混入一条脏记录：解析只存活 19 条，
        // 但 hasMore 按原始条数判断，分页不能被提前钉死
        let bare = Value::Array(records.clone());
        let page = parse_message_page(&bare, PAGE_SIZE).unwrap();
        assert_eq!(page.messages.len(), PAGE_SIZE as usize - 1);
        assert!(page.has_more);

        let wrapped = serde_json::json!({ "content": records });
        let page = parse_message_page(&wrapped, PAGE_SIZE).unwrap();
        assert_eq!(page.messages.len(), PAGE_SIZE as usize - 1);
        assert!(page.has_more);

        // 空的 content 包装仍是可识别的"到底了"
        let empty = serde_json::json!({"content": []});
        let page = parse_message_page(&empty, PAGE_SIZE).unwrap();
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn test_parse_conversation_object_unwraps_envelopes() {
        let v = serde_json::json!({
            "data": {"conversation": {"id": 9, "studentId": 1, "tutorId": 2}}
        });
        let conv = parse_conversation_object(&v).unwrap();
        assert_eq!(conv.id, "9");
        assert!(conv.is_between(1, 2));
    }
}
