//! 核心数据模型与服务端 DTO
//!
//! 服务端返回的字段拼写不统一（`studentId`/`user1Id`、`id`/`conversationId`、
//! 数字或字符串形式的 ID 等），全部在本模块的 Record 结构体这一个翻译点
//! 通过 serde alias 吸收，对内只暴露一种规范形态。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 用户引用（ID + 最小展示字段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar_url: String,
}

impl UserRef {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            avatar_url: String::new(),
        }
    }
}

/// 会话
///
/// 服务端确认创建后 `id` 即为权威 ID；在此之前使用客户端生成的
/// 临时 ID（`local_` 前缀）。临时 ID 确认后仍作为查询别名永久有效。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub student: UserRef,
    pub tutor: UserRef,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub unread_count: i32,
    /// 仅存在于本地的兜底会话（服务端创建失败时合成）
    #[serde(default)]
    pub local_only: bool,
}

impl Conversation {
    /// 判断会话是否是指定两个用户之间的配对（与参数顺序无关）
    pub fn is_between(&self, a: i64, b: i64) -> bool {
        (self.student.id == a && self.tutor.id == b)
            || (self.student.id == b && self.tutor.id == a)
    }

    /// 返回除 `user_id` 外的另一方参与者
    pub fn peer_of(&self, user_id: i64) -> &UserRef {
        if self.student.id == user_id {
            &self.tutor
        } else {
            &self.student
        }
    }
}

/// 消息投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryState {
    /// 乐观展示中，等待服务端确认
    Pending,
    /// 服务端已确认
    ConfirmedServer,
    /// 从未到达服务器，仅存于本地缓存
    LocalOnly,
}

/// 消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
    /// 毫秒时间戳，会话内按此排序展示
    pub timestamp: i64,
    pub delivery_state: DeliveryState,
    #[serde(default)]
    pub is_read: bool,
}

/// 生成客户端本地 ID（带前缀，跨会话唯一）
pub fn generate_local_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4())
}

/// 当前毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// ID 字段的宽容反序列化：接受字符串或数字，空串视为缺失
fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<Value> = Deserialize::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

/// 时间戳的宽容反序列化：接受毫秒数字或 RFC3339 字符串
fn de_opt_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<Value> = Deserialize::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.timestamp_millis()),
        _ => None,
    }))
}

/// 服务端会话记录（宽容形态，各端点的字段拼写差异在此吸收）
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    #[serde(default, alias = "conversationId", deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default, alias = "user1Id")]
    pub student_id: Option<i64>,
    #[serde(default, alias = "user2Id")]
    pub tutor_id: Option<i64>,
    #[serde(default, alias = "user1Name")]
    pub student_name: Option<String>,
    #[serde(default, alias = "user2Name")]
    pub tutor_name: Option<String>,
    #[serde(default, alias = "user1Avatar")]
    pub student_avatar: Option<String>,
    #[serde(default, alias = "user2Avatar")]
    pub tutor_avatar: Option<String>,
    #[serde(default, alias = "lastMessagePreview", alias = "latestMessage")]
    pub last_message: Option<String>,
    #[serde(
        default,
        alias = "lastMessageTime",
        deserialize_with = "de_opt_millis"
    )]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub unread_count: Option<i32>,
}

impl ConversationRecord {
    /// 转为规范会话；缺少 ID 或任一参与方时视为不可识别记录
    pub fn into_conversation(self) -> Option<Conversation> {
        let id = self.id?;
        let student_id = self.student_id?;
        let tutor_id = self.tutor_id?;
        Some(Conversation {
            id,
            student: UserRef {
                id: student_id,
                name: self.student_name.unwrap_or_default(),
                avatar_url: self.student_avatar.unwrap_or_default(),
            },
            tutor: UserRef {
                id: tutor_id,
                name: self.tutor_name.unwrap_or_default(),
                avatar_url: self.tutor_avatar.unwrap_or_default(),
            },
            last_message: self.last_message.unwrap_or_default(),
            updated_at: self.updated_at.unwrap_or(0),
            unread_count: self.unread_count.unwrap_or(0).max(0),
            local_only: false,
        })
    }
}

/// 服务端消息记录（宽容形态）
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default, alias = "messageId", deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub receiver_id: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "sentAt", alias = "createdAt", deserialize_with = "de_opt_millis")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub is_read: Option<bool>,
}

impl MessageRecord {
    /// 转为规范消息（来自服务端，投递状态即为已确认）
    ///
    /// 缺 ID、缺会话或正文为空的记录不可识别，丢弃。
    pub fn into_message(self) -> Option<Message> {
        let id = self.id?;
        let conversation_id = self.conversation_id?;
        let content = self.content.filter(|c| !c.is_empty())?;
        Some(Message {
            id,
            conversation_id,
            sender_id: self.sender_id.unwrap_or(0),
            receiver_id: self.receiver_id.unwrap_or(0),
            content,
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            delivery_state: DeliveryState::ConfirmedServer,
            is_read: self.is_read.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_record_aliases() {
        // 两种拼写应归一到同一个规范形态
        let a: ConversationRecord = serde_json::from_str(
            r#"{"id": 7, "studentId": 1, "tutorId": 2, "lastMessagePreview": "hi"}"#,
        )
        .unwrap();
        let b: ConversationRecord = serde_json::from_str(
            r#"{"conversationId": "7", "user1Id": 1, "user2Id": 2, "latestMessage": "hi"}"#,
        )
        .unwrap();
        let a = a.into_conversation().unwrap();
        let b = b.into_conversation().unwrap();
        assert_eq!(a.id, "7");
        assert_eq!(a.id, b.id);
        assert_eq!(a.student.id, b.student.id);
        assert_eq!(a.last_message, "hi");
        assert!(a.is_between(2, 1));
    }

    #[test]
    fn test_message_record_tolerant_timestamp() {
        let m: MessageRecord = serde_json::from_str(
            r#"{"id": 3, "conversationId": 7, "senderId": 1, "receiverId": 2,
                "content": "hello", "sentAt": "2026-01-02T03:04:05+00:00"}"#,
        )
        .unwrap();
        let m = m.into_message().unwrap();
        assert_eq!(m.id, "3");
        assert_eq!(m.conversation_id, "7");
        assert!(m.timestamp > 0);
        assert_eq!(m.delivery_state, DeliveryState::ConfirmedServer);
    }

    #[test]
    fn test_message_record_rejects_empty_content() {
        let m: MessageRecord =
            serde_json::from_str(r#"{"id": 3, "conversationId": 7, "content": ""}"#).unwrap();
        assert!(m.into_message().is_none());
    }
}
