//! 向更早方向的消息分页
//!
//! 每个会话维护一个页游标和一个 in-flight 闩：快速连续触发
//! （快速滚动、双击）不会发出重复请求。`has_more` 一旦变为 false
//! 即对该会话永久生效——服务端报告没有更多页，或已走过缓存兜底
//! （缓存不会比它持有的更多）。

use crate::chat::api::{ChatApi, MessagePage, PAGE_SIZE};
use crate::chat::cache::LocalCache;
use crate::chat::error::ChatError;
use crate::chat::types::Message;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 会话页游标
#[derive(Debug, Clone)]
struct PageCursor {
    /// 下一次要加载的页号
    page_index: u32,
    has_more: bool,
    in_flight: bool,
}

impl PageCursor {
    fn fresh() -> Self {
        Self {
            page_index: 0,
            has_more: true,
            in_flight: false,
        }
    }
}

/// 一次分页加载的结果
#[derive(Debug, Clone)]
pub struct PageResult {
    pub messages: Vec<Message>,
    pub has_more: bool,
    /// 数据来自缓存兜底（调用方据此发出软离线提示）
    pub from_cache: bool,
}

impl PageResult {
    fn empty(has_more: bool) -> Self {
        Self {
            messages: Vec::new(),
            has_more,
            from_cache: false,
        }
    }
}

/// 分页器
pub struct Paginator {
    api: Arc<ChatApi>,
    cache: Arc<LocalCache>,
    cursors: Mutex<HashMap<String, PageCursor>>,
}

impl Paginator {
    pub fn new(api: Arc<ChatApi>, cache: Arc<LocalCache>) -> Self {
        Self {
            api,
            cache,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// 加载第一页，游标重置到 page 0
    ///
    /// 端点耗尽时回退到本地缓存，并把 `has_more` 永久钉死为 false。
    pub async fn load_first_page(&self, conversation_id: &str) -> Result<PageResult> {
        {
            let mut cursors = self.cursors.lock().await;
            let cursor = cursors
                .entry(conversation_id.to_string())
                .or_insert_with(PageCursor::fresh);
            if cursor.in_flight {
                debug!(
                    "[Page] 已有在途请求，忽略首页加载 (conversationID={})",
                    conversation_id
                );
                return Ok(PageResult::empty(cursor.has_more));
            }
            // 只重置页号；has_more 一旦钉死为 false 不允许复活
            cursor.page_index = 0;
            cursor.in_flight = true;
        }

        let fetched = self.api.fetch_messages(conversation_id, 0).await;
        self.settle(conversation_id, 0, fetched).await
    }

    /// 加载下一页（更早的消息）
    ///
    /// in-flight 闩在发出请求前检查，无论结果如何都会清除。
    pub async fn load_next_page(&self, conversation_id: &str) -> Result<PageResult> {
        let page;
        {
            let mut cursors = self.cursors.lock().await;
            let cursor = cursors
                .entry(conversation_id.to_string())
                .or_insert_with(PageCursor::fresh);
            if !cursor.has_more {
                debug!(
                    "[Page] 没有更多历史消息 (conversationID={})",
                    conversation_id
                );
                return Ok(PageResult::empty(false));
            }
            if cursor.in_flight {
                debug!(
                    "[Page] 已有在途请求，忽略重复触发 (conversationID={})",
                    conversation_id
                );
                return Ok(PageResult::empty(true));
            }
            cursor.in_flight = true;
            page = cursor.page_index;
        }

        let fetched = self.api.fetch_messages(conversation_id, page).await;
        self.settle(conversation_id, page, fetched).await
    }

    /// 结算一次请求：清除闩、推进游标、端点耗尽时走缓存兜底
    async fn settle(
        &self,
        conversation_id: &str,
        page: u32,
        fetched: Result<MessagePage>,
    ) -> Result<PageResult> {
        match fetched {
            Ok(page_resp) => {
                let mut cursors = self.cursors.lock().await;
                let cursor = cursors
                    .entry(conversation_id.to_string())
                    .or_insert_with(PageCursor::fresh);
                cursor.in_flight = false;
                cursor.page_index = page + 1;
                // has_more 只会单调走向 false
                cursor.has_more = cursor.has_more && page_resp.has_more;
                info!(
                    "[Page] ✅ 第 {} 页加载完成 (conversationID={}, {} 条, hasMore={})",
                    page,
                    conversation_id,
                    page_resp.messages.len(),
                    cursor.has_more
                );
                Ok(PageResult {
                    messages: page_resp.messages,
                    has_more: cursor.has_more,
                    from_cache: false,
                })
            }
            Err(e) => {
                let exhausted = matches!(
                    e.downcast_ref::<ChatError>(),
                    Some(ChatError::EndpointExhausted { .. })
                );
                {
                    let mut cursors = self.cursors.lock().await;
                    let cursor = cursors
                        .entry(conversation_id.to_string())
                        .or_insert_with(PageCursor::fresh);
                    cursor.in_flight = false;
                    cursor.has_more = false;
                }
                if !exhausted {
                    return Err(e);
                }
                warn!(
                    "[Page] ⚠️ 端点耗尽，回退到本地缓存 (conversationID={})",
                    conversation_id
                );
                // 缓存兜底只对首页有意义；后续页没有更早的数据可给
                let messages = if page == 0 {
                    self.cache.load_messages(conversation_id).await?
                } else {
                    Vec::new()
                };
                Ok(PageResult {
                    messages,
                    has_more: false,
                    from_cache: true,
                })
            }
        }
    }

    /// 当前页大小（固定值，供上层展示用）
    pub fn page_size(&self) -> u32 {
        PAGE_SIZE
    }
}
