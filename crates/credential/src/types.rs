//! 凭证类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 凭证状态
///
/// 状态写入凭证存储仅作参考信息；"此刻能否使用"的裁决权在
/// 冷却跟踪器手里，一个 Healthy 的凭证仍可能处于冷却期。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// 正常可用
    Healthy,
    /// 冷却中（限流或临时错误后的参考标记）
    CoolingDown,
    /// 配额耗尽
    Exhausted,
    /// 已吊销，不再参与任何操作
    Revoked,
}

impl CredentialStatus {
    /// 是否允许参与选取
    ///
    /// CoolingDown 仍可选取，真正的排除由冷却跟踪器判断。
    pub fn selectable(self) -> bool {
        matches!(self, Self::Healthy | Self::CoolingDown)
    }
}

/// 凭证记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// 凭证标识
    pub id: String,
    /// 上游认证令牌（不透明）
    pub secret: String,
    /// 参考状态
    pub status: CredentialStatus,
    /// 剩余配额，None 表示未知/不限
    #[serde(default)]
    pub quota: Option<u32>,
    /// 自上次重置以来的使用次数（选取平局时的裁决依据）
    #[serde(default)]
    pub use_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            status: CredentialStatus::Healthy,
            quota: None,
            use_count: 0,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    /// 是否具备被选取的基本条件（状态与配额）
    pub fn is_selectable(&self) -> bool {
        self.status.selectable() && self.quota != Some(0)
    }
}
