//! 投递调和器
//!
//! 入站（推送/轮询/分页）与出站（乐观回显）消息合并为单一有序去重列表。
//! 两步匹配：先按 ID 精确匹配，再按"发送方 + 正文 + 5 秒时间窗"收拢
//! 乐观回显——UI 发送时立即展示本地条目，服务端回显到达后不能出现重复。

use crate::chat::types::{DeliveryState, Message};
use tracing::debug;

/// 回显收拢的时间容差（毫秒）
///
/// 经验值而非协议保证，见 DESIGN.md；只对 Pending 条目生效，
/// 不可能误并两条已确认消息。
pub const ECHO_TOLERANCE_MS: i64 = 5_000;

/// 单条合并的结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// 追加为新消息
    Appended,
    /// 按 ID 命中已有条目并覆盖（Pending → 确认，或幂等重放）
    Replaced,
    /// 命中乐观回显，采纳服务端 ID 与确认状态
    EchoCollapsed,
}

/// 合并单条入站消息，返回后的列表保持 (timestamp, id) 升序
pub fn merge(existing: &mut Vec<Message>, incoming: Message) -> MergeOutcome {
    let outcome = place(existing, incoming);
    sort_messages(existing);
    outcome
}

/// 合并一页历史消息（分页路径）
///
/// 分页不会产生乐观重复，只走 ID 去重 + 追加，绝不使用回显启发式。
/// 返回实际新增的条数。
pub fn merge_page(existing: &mut Vec<Message>, page: Vec<Message>) -> usize {
    let mut appended = 0;
    for msg in page {
        if let Some(slot) = existing.iter_mut().find(|m| m.id == msg.id) {
            *slot = msg;
        } else {
            existing.push(msg);
            appended += 1;
        }
    }
    sort_messages(existing);
    appended
}

fn place(existing: &mut Vec<Message>, incoming: Message) -> MergeOutcome {
    // 1. ID 精确匹配：服务端确认覆盖本地回显；重放为幂等空操作
    if let Some(slot) = existing.iter_mut().find(|m| m.id == incoming.id) {
        debug!(
            "[Merge] 命中已有消息 id={}，覆盖（{:?} -> {:?}）",
            incoming.id, slot.delivery_state, incoming.delivery_state
        );
        *slot = incoming;
        return MergeOutcome::Replaced;
    }

    // 2. 回显收拢：同发送方、同正文、时间差在容差内的 Pending 条目
    //    视为这条服务端消息的乐观孪生，采纳服务端 ID
    if incoming.delivery_state == DeliveryState::ConfirmedServer {
        if let Some(slot) = existing.iter_mut().find(|m| {
            m.delivery_state == DeliveryState::Pending
                && m.sender_id == incoming.sender_id
                && m.content == incoming.content
                && (m.timestamp - incoming.timestamp).abs() <= ECHO_TOLERANCE_MS
        }) {
            debug!(
                "[Merge] 回显收拢: 本地 id={} 采纳服务端 id={}",
                slot.id, incoming.id
            );
            *slot = incoming;
            return MergeOutcome::EchoCollapsed;
        }
    }

    // 3. 追加为新消息
    existing.push(incoming);
    MergeOutcome::Appended
}

/// 按 (timestamp, id) 升序排序，同一时间戳用 ID 保证确定性
pub fn sort_messages(list: &mut [Message]) {
    list.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::types::{DeliveryState, Message};

    fn msg(id: &str, ts: i64, sender: i64, content: &str, state: DeliveryState) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: sender,
            receiver_id: 99,
            content: content.to_string(),
            timestamp: ts,
            delivery_state: state,
            is_read: false,
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut list = Vec::new();
        let m = msg("s1", 1000, 1, "hello", DeliveryState::ConfirmedServer);
        assert_eq!(merge(&mut list, m.clone()), MergeOutcome::Appended);
        let before = list.clone();
        // 重复投递（at-least-once 传输的预期行为）不产生重复条目
        assert_eq!(merge(&mut list, m), MergeOutcome::Replaced);
        assert_eq!(list, before);
    }

    #[test]
    fn test_echo_collapse_within_window() {
        let mut list = Vec::new();
        merge(
            &mut list,
            msg("local_1", 1000, 1, "hi", DeliveryState::Pending),
        );
        let outcome = merge(
            &mut list,
            msg("s1", 3000, 1, "hi", DeliveryState::ConfirmedServer),
        );
        assert_eq!(outcome, MergeOutcome::EchoCollapsed);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "s1");
        assert_eq!(list[0].delivery_state, DeliveryState::ConfirmedServer);
    }

    #[test]
    fn test_echo_outside_window_appends() {
        let mut list = Vec::new();
        merge(
            &mut list,
            msg("local_1", 1000, 1, "hi", DeliveryState::Pending),
        );
        let outcome = merge(
            &mut list,
            msg(
                "s1",
                1000 + ECHO_TOLERANCE_MS + 1,
                1,
                "hi",
                DeliveryState::ConfirmedServer,
            ),
        );
        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_confirmed_entries_never_collapse() {
        let mut list = Vec::new();
        merge(
            &mut list,
            msg("s1", 1000, 1, "hi", DeliveryState::ConfirmedServer),
        );
        // 同人同文同窗，但已有条目不是 Pending：必须保留两条
        let outcome = merge(
            &mut list,
            msg("s2", 1500, 1, "hi", DeliveryState::ConfirmedServer),
        );
        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_ordering_invariant_after_merges() {
        let mut list = Vec::new();
        merge(&mut list, msg("s3", 3000, 1, "c", DeliveryState::ConfirmedServer));
        merge(&mut list, msg("s1", 1000, 2, "a", DeliveryState::ConfirmedServer));
        merge(&mut list, msg("s2", 2000, 1, "b", DeliveryState::ConfirmedServer));
        // 同时间戳按 ID 打破平局，保证确定性
        merge(&mut list, msg("s0", 2000, 2, "d", DeliveryState::ConfirmedServer));
        let timestamps: Vec<i64> = list.iter().map(|m| m.timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
        assert_eq!(list[1].id, "s0");
        assert_eq!(list[2].id, "s2");
    }

    #[test]
    fn test_merge_page_skips_echo_heuristic() {
        let mut list = Vec::new();
        merge(
            &mut list,
            msg("local_1", 1000, 1, "hi", DeliveryState::Pending),
        );
        // 分页加载的历史消息即使满足回显条件也只走追加路径
        let added = merge_page(
            &mut list,
            vec![msg("s1", 1500, 1, "hi", DeliveryState::ConfirmedServer)],
        );
        assert_eq!(added, 1);
        assert_eq!(list.len(), 2);
    }
}
