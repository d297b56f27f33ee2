//! 本地缓存（SQLite，键 → JSON 数组）
//!
//! 最后手段的数据来源：端点全部失败后读它，每次成功变更后写它。
//! 键空间与服务端约定一致：`conversations_{userId}`、`messages_{conversationId}`。
//! 写入策略为 last-write-wins——它是缓存，不是权威数据源。

use crate::chat::reconcile::{merge_page, sort_messages};
use crate::chat::types::{Conversation, DeliveryState, Message};
use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use tracing::{debug, warn};

/// 每个会话最多缓存的消息条数（超出时按时间戳淘汰最旧的）
pub const MAX_CACHED_MESSAGES: usize = 50;

/// 本地缓存存储
pub struct LocalCache {
    pool: Pool<Sqlite>,
}

impl LocalCache {
    /// 打开（或创建）缓存数据库
    ///
    /// 例如：`sqlite://chat_cache.db?mode=rwc`，测试用 `sqlite::memory:`
    pub async fn new(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await
            .context(format!("连接缓存数据库失败: {}", db_url))?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_cache (
                cache_key   TEXT PRIMARY KEY,
                payload     TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    fn conversations_key(user_id: i64) -> String {
        format!("conversations_{}", user_id)
    }

    fn messages_key(conversation_id: &str) -> String {
        format!("messages_{}", conversation_id)
    }

    async fn save_raw(&self, key: &str, payload: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO chat_cache (cache_key, payload, updated_at) VALUES (?,?,?)",
        )
        .bind(key)
        .bind(payload)
        .bind(crate::chat::types::now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_raw(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT payload FROM chat_cache WHERE cache_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("payload")))
    }

    /// 缓存用户的会话列表
    pub async fn save_conversations(&self, user_id: i64, list: &[Conversation]) -> Result<()> {
        let json = serde_json::to_string(list)?;
        self.save_raw(&Self::conversations_key(user_id), &json).await?;
        debug!("[Cache] 💾 已缓存 {} 个会话 (user={})", list.len(), user_id);
        Ok(())
    }

    /// 读取用户的会话列表；键不存在视为空结果，不是错误
    pub async fn load_conversations(&self, user_id: i64) -> Result<Vec<Conversation>> {
        match self.load_raw(&Self::conversations_key(user_id)).await? {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("[Cache] ⚠️ 会话缓存解析失败，按空处理: {}", e);
                Vec::new()
            })),
            None => Ok(Vec::new()),
        }
    }

    /// 缓存会话消息，只保留时间戳最新的 `MAX_CACHED_MESSAGES` 条
    pub async fn save_messages(&self, conversation_id: &str, list: &[Message]) -> Result<()> {
        let mut capped: Vec<Message> = list.to_vec();
        sort_messages(&mut capped);
        if capped.len() > MAX_CACHED_MESSAGES {
            capped.drain(..capped.len() - MAX_CACHED_MESSAGES);
        }
        let json = serde_json::to_string(&capped)?;
        self.save_raw(&Self::messages_key(conversation_id), &json).await?;
        debug!(
            "[Cache] 💾 已缓存 {} 条消息 (conversationID={})",
            capped.len(),
            conversation_id
        );
        Ok(())
    }

    /// 读取会话消息；键不存在视为空结果
    pub async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        match self.load_raw(&Self::messages_key(conversation_id)).await? {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("[Cache] ⚠️ 消息缓存解析失败，按空处理: {}", e);
                Vec::new()
            })),
            None => Ok(Vec::new()),
        }
    }

    /// 临时会话被服务端权威会话取代时，把旧键下遗留的 localOnly
    /// 消息改挂到权威键下，返回实际迁移的条数
    ///
    /// 未发出的消息不允许从视图中消失；已确认的消息服务端有权威
    /// 副本，留在旧键下即可。
    pub async fn migrate_local_messages(
        &self,
        from_conversation: &str,
        to_conversation: &str,
    ) -> Result<usize> {
        let pending: Vec<Message> = self
            .load_messages(from_conversation)
            .await?
            .into_iter()
            .filter(|m| m.delivery_state == DeliveryState::LocalOnly)
            .map(|mut m| {
                m.conversation_id = to_conversation.to_string();
                m
            })
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let mut target = self.load_messages(to_conversation).await?;
        let moved = merge_page(&mut target, pending);
        self.save_messages(to_conversation, &target).await?;
        debug!(
            "[Cache] 📦 已迁移 {} 条本地消息 ({} -> {})",
            moved, from_conversation, to_conversation
        );
        Ok(moved)
    }

    /// 追加单条消息（读-改-写，localOnly 兜底路径使用）
    pub async fn append_message(&self, message: &Message) -> Result<()> {
        let mut list = self.load_messages(&message.conversation_id).await?;
        if let Some(slot) = list.iter_mut().find(|m| m.id == message.id) {
            *slot = message.clone();
        } else {
            list.push(message.clone());
        }
        self.save_messages(&message.conversation_id, &list).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::types::{DeliveryState, UserRef};

    fn msg(id: &str, ts: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: 1,
            receiver_id: 2,
            content: format!("msg-{}", id),
            timestamp: ts,
            delivery_state: DeliveryState::ConfirmedServer,
            is_read: false,
        }
    }

    #[tokio::test]
    async fn test_messages_capped_to_most_recent() {
        let cache = LocalCache::new("sqlite::memory:").await.unwrap();
        let list: Vec<Message> = (0..(MAX_CACHED_MESSAGES as i64 + 20))
            .map(|i| msg(&format!("s{:03}", i), 1000 + i))
            .collect();
        cache.save_messages("c1", &list).await.unwrap();

        let loaded = cache.load_messages("c1").await.unwrap();
        assert_eq!(loaded.len(), MAX_CACHED_MESSAGES);
        // 淘汰最旧的，保留时间戳最大的 N 条
        assert_eq!(loaded.first().unwrap().id, "s020");
        assert_eq!(loaded.last().unwrap().timestamp, 1000 + 69);
    }

    #[tokio::test]
    async fn test_cache_miss_is_empty_result() {
        let cache = LocalCache::new("sqlite::memory:").await.unwrap();
        assert!(cache.load_messages("missing").await.unwrap().is_empty());
        assert!(cache.load_conversations(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversations_roundtrip() {
        let cache = LocalCache::new("sqlite::memory:").await.unwrap();
        let conv = Conversation {
            id: "7".to_string(),
            student: UserRef::new(1, "学生"),
            tutor: UserRef::new(2, "老师"),
            last_message: "hi".to_string(),
            updated_at: 123,
            unread_count: 3,
            local_only: false,
        };
        cache.save_conversations(1, &[conv.clone()]).await.unwrap();
        let loaded = cache.load_conversations(1).await.unwrap();
        assert_eq!(loaded, vec![conv]);
    }

    #[tokio::test]
    async fn test_migrate_moves_local_only_to_canonical_key() {
        let cache = LocalCache::new("sqlite::memory:").await.unwrap();
        let mut pending = msg("local_m1", 1000);
        pending.conversation_id = "local_x".to_string();
        pending.delivery_state = DeliveryState::LocalOnly;
        let mut echoed = msg("s1", 900);
        echoed.conversation_id = "local_x".to_string();
        cache
            .save_messages("local_x", &[pending, echoed])
            .await
            .unwrap();
        let mut canonical = msg("s2", 2000);
        canonical.conversation_id = "c9".to_string();
        cache.save_messages("c9", &[canonical]).await.unwrap();

        let moved = cache.migrate_local_messages("local_x", "c9").await.unwrap();
        assert_eq!(moved, 1);

        // localOnly 消息并入权威键且会话 ID 已改写；已确认的不迁移
        let merged = cache.load_messages("c9").await.unwrap();
        assert_eq!(merged.len(), 2);
        let migrated = merged.iter().find(|m| m.id == "local_m1").unwrap();
        assert_eq!(migrated.conversation_id, "c9");
        assert_eq!(migrated.delivery_state, DeliveryState::LocalOnly);
    }

    #[tokio::test]
    async fn test_append_message_upserts() {
        let cache = LocalCache::new("sqlite::memory:").await.unwrap();
        let mut m = msg("local_1", 1000);
        m.delivery_state = DeliveryState::LocalOnly;
        cache.append_message(&m).await.unwrap();
        cache.append_message(&m).await.unwrap();
        let loaded = cache.load_messages("c1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].delivery_state, DeliveryState::LocalOnly);
    }
}
