//! 冷却期管理
//!
//! 跟踪每个凭证的临时不可用窗口。窗口内 `is_usable` 严格为 false，
//! 到期条目在读取时惰性删除，不需要后台清扫任务。
//! 标记冷却是尽力而为的操作，永远不会阻塞调用方。

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 冷却原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    /// 上游限流
    RateLimited,
    /// 临时错误（含超时）
    TransientError,
    /// 配额耗尽
    QuotaExhausted,
}

/// 各原因的冷却时长配置（秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_rate_limited_secs")]
    pub rate_limited_secs: u64,
    #[serde(default = "default_transient_error_secs")]
    pub transient_error_secs: u64,
    #[serde(default = "default_quota_exhausted_secs")]
    pub quota_exhausted_secs: u64,
}

fn default_rate_limited_secs() -> u64 {
    300
}
fn default_transient_error_secs() -> u64 {
    30
}
fn default_quota_exhausted_secs() -> u64 {
    3600
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            rate_limited_secs: default_rate_limited_secs(),
            transient_error_secs: default_transient_error_secs(),
            quota_exhausted_secs: default_quota_exhausted_secs(),
        }
    }
}

impl CooldownConfig {
    pub fn duration_for(&self, reason: CooldownReason) -> Duration {
        let secs = match reason {
            CooldownReason::RateLimited => self.rate_limited_secs,
            CooldownReason::TransientError => self.transient_error_secs,
            CooldownReason::QuotaExhausted => self.quota_exhausted_secs,
        };
        Duration::seconds(secs as i64)
    }
}

/// 冷却条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub credential_id: String,
    pub reason: CooldownReason,
    pub expires_at: DateTime<Utc>,
}

/// 冷却跟踪器
///
/// 没有条目即视为可用。"此刻能否使用"以这里为准，
/// 凭证存储里的状态只是参考信息。
#[derive(Default)]
pub struct CooldownTracker {
    entries: DashMap<String, CooldownEntry>,
    config: CooldownConfig,
}

impl CooldownTracker {
    pub fn new(config: CooldownConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// 按配置时长标记冷却
    pub fn mark(&self, credential_id: &str, reason: CooldownReason) {
        self.mark_for(credential_id, reason, self.config.duration_for(reason));
    }

    /// 以指定时长标记冷却；已有窗口只延长，不缩短
    pub fn mark_for(&self, credential_id: &str, reason: CooldownReason, duration: Duration) {
        let expires_at = Utc::now() + duration;
        let mut entry = self
            .entries
            .entry(credential_id.to_string())
            .or_insert_with(|| CooldownEntry {
                credential_id: credential_id.to_string(),
                reason,
                expires_at,
            });
        if expires_at > entry.expires_at {
            entry.reason = reason;
            entry.expires_at = expires_at;
        }
        info!(
            credential_id = %credential_id,
            ?reason,
            expires_at = %entry.expires_at,
            "凭证进入冷却期"
        );
    }

    /// 此刻是否可用
    pub fn is_usable(&self, credential_id: &str) -> bool {
        self.usable_at(credential_id, Utc::now())
    }

    fn usable_at(&self, credential_id: &str, now: DateTime<Utc>) -> bool {
        if let Some(entry) = self.entries.get(credential_id) {
            if now < entry.expires_at {
                return false;
            }
            drop(entry);
            // 到期条目惰性删除
            self.entries.remove(credential_id);
            debug!(credential_id = %credential_id, "冷却期结束");
        }
        true
    }

    /// 剩余冷却时长
    pub fn remaining(&self, credential_id: &str) -> Option<Duration> {
        let entry = self.entries.get(credential_id)?;
        let remaining = entry.expires_at - Utc::now();
        (remaining > Duration::zero()).then_some(remaining)
    }

    /// 显式解除冷却
    pub fn clear(&self, credential_id: &str) {
        if self.entries.remove(credential_id).is_some() {
            info!(credential_id = %credential_id, "冷却期已手动解除");
        }
    }

    /// 当前存活条目快照（统计用）
    pub fn snapshot(&self) -> Vec<CooldownEntry> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| now < e.expires_at)
            .map(|e| e.value().clone())
            .collect()
    }
}
