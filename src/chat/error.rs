//! 聊天引擎错误分类
//!
//! 网络层错误只要存在兜底路径就地恢复，不向 UI 抛硬错误；
//! 调用方通过 `anyhow::Error::downcast_ref::<ChatError>()` 识别具体类别。

use thiserror::Error;

/// 聊天引擎的错误分类
#[derive(Debug, Error)]
pub enum ChatError {
    /// 所有候选 REST 端点都失败或返回不可识别的结构
    ///
    /// 恢复方式：调用方回退到本地缓存，向上只表现为"离线"软提示。
    #[error("所有候选端点均已耗尽（尝试 {attempts} 次）")]
    EndpointExhausted { attempts: usize },

    /// 推送通道无法建立连接
    ///
    /// 恢复方式：切换到轮询降级模式，重连时重新评估。
    #[error("推送通道不可用: {0}")]
    TransportUnavailable(String),

    /// 消息无法送达服务器
    ///
    /// 恢复方式：以 localOnly 状态写入本地缓存，向 UI 返回降级成功。
    #[error("消息发送失败: {0}")]
    SendFailed(String),

    /// 参与方 ID 缺失或非法，连本地兜底会话都无法合成（唯一的致命错误）
    #[error("参与方信息非法: {0}")]
    InvalidParticipant(String),

    /// 当前没有打开的会话，无法执行针对活动会话的操作
    #[error("当前没有活动会话")]
    NoActiveConversation,
}
