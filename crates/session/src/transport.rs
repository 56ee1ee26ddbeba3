//! 上游传输契约
//!
//! 核心只定义并调用这四个操作，不实现上游线协议。
//! 开启/续聊由请求处理层在拿到解析结果后调用，
//! 分享/克隆由迁移流程在交接会话时调用。

use async_trait::async_trait;
use relaycast_core::ChatMessage;
use relaycast_credential::{CooldownReason, Credential};

/// 上游传输错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("上游请求超时")]
    Timeout,

    #[error("上游会话不存在: {0}")]
    ConversationNotFound(String),

    #[error("上游拒绝凭证")]
    Unauthorized,

    #[error("上游限流")]
    RateLimited,

    #[error("上游错误: {0}")]
    Upstream(String),
}

impl TransportError {
    /// 该错误应给当前凭证标记哪种冷却
    ///
    /// 只有超时与限流说明凭证本身出了问题；克隆被拒、会话不存在
    /// 这类业务失败不该惩罚凭证。
    pub fn cooldown_reason(&self) -> Option<CooldownReason> {
        match self {
            Self::Timeout => Some(CooldownReason::TransientError),
            Self::RateLimited => Some(CooldownReason::RateLimited),
            Self::Upstream(_) | Self::ConversationNotFound(_) | Self::Unauthorized => None,
        }
    }
}

/// 开启会话的返回
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    pub conversation_id: String,
    pub response_id: String,
}

/// 上游传输契约
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// 以给定凭证开启新会话
    async fn start_conversation(
        &self,
        credential: &Credential,
        messages: &[ChatMessage],
    ) -> Result<ConversationHandle, TransportError>;

    /// 在既有会话上追加一轮
    async fn continue_conversation(
        &self,
        credential: &Credential,
        conversation_id: &str,
        message: &ChatMessage,
    ) -> Result<String, TransportError>;

    /// 用归属凭证生成可转移的分享引用
    async fn share_conversation(
        &self,
        credential: &Credential,
        conversation_id: &str,
    ) -> Result<String, TransportError>;

    /// 用替补凭证从分享引用克隆出自己名下的新会话
    async fn clone_conversation(
        &self,
        credential: &Credential,
        share_ref: &str,
    ) -> Result<String, TransportError>;
}
