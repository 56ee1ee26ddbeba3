//! 跨账号续聊（分享 + 克隆交接）
//!
//! 会话归属凭证不可用时，用原凭证生成分享引用，再让替补凭证
//! 克隆出自己名下的新上游会话。这是一个两方两步的分布式操作，
//! 存在部分失败：每次交接显式建模为一条 ShareGrant，
//! 重试与超时都有对象可查可记。
//!
//! 失败策略：原凭证已吊销则立即失败（无人能从吊销凭证分享）；
//! 克隆失败换下一个替补重试，超出预算返回错误，由上层回退到
//! 全新会话。分享/克隆都带超时，超时按失败处理并给当时使用的
//! 凭证标记冷却，反复超时的凭证会被自然轮换掉。

use crate::index::ConversationRecord;
use crate::transport::{TransportError, UpstreamTransport};
use chrono::{DateTime, Utc};
use relaycast_credential::{
    CooldownReason, CooldownTracker, Credential, CredentialSelector, CredentialStatus, SelectError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 迁移配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// 首个替补失败后追加尝试的次数
    #[serde(default = "default_extra_attempts")]
    pub extra_attempts: u32,
    /// 分享/克隆单步超时（秒）
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

fn default_extra_attempts() -> u32 {
    2
}
fn default_step_timeout_secs() -> u64 {
    30
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            extra_attempts: default_extra_attempts(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl MigrationConfig {
    fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// 交接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantState {
    Pending,
    Granted,
    Failed,
}

/// 一次交接尝试
///
/// 仅在交接期间存活，结束（成功或终态失败）后即丢弃，不持久化。
#[derive(Debug, Clone)]
pub struct ShareGrant {
    pub source_credential_id: String,
    pub target_credential_id: String,
    pub conversation_id: String,
    pub state: GrantState,
    pub created_at: DateTime<Utc>,
}

impl ShareGrant {
    fn new(source: &str, target: &str, conversation_id: &str) -> Self {
        Self {
            source_credential_id: source.to_string(),
            target_credential_id: target.to_string(),
            conversation_id: conversation_id.to_string(),
            state: GrantState::Pending,
            created_at: Utc::now(),
        }
    }

    fn granted(&mut self) {
        self.state = GrantState::Granted;
    }

    fn failed(&mut self) {
        self.state = GrantState::Failed;
    }
}

/// 迁移错误
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("原凭证 {0} 已吊销，无法分享会话")]
    OwnerRevoked(String),

    #[error("分享会话失败: {0}")]
    ShareFailed(TransportError),

    #[error("没有可用的替补凭证")]
    NoSubstitute,

    #[error("克隆重试预算已耗尽（共尝试 {attempts} 次）")]
    AttemptsExhausted { attempts: u32 },

    #[error(transparent)]
    Select(SelectError),
}

/// 迁移结果
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// 接手的替补凭证
    pub credential: Credential,
    /// 替补名下的新上游会话 ID
    pub conversation_id: String,
    /// 本次使用的分享引用（写回记录备下次复用）
    pub share_ref: String,
}

/// 会话迁移器
pub struct ConversationMigrator {
    transport: Arc<dyn UpstreamTransport>,
    selector: Arc<CredentialSelector>,
    cooldowns: Arc<CooldownTracker>,
    config: MigrationConfig,
}

impl ConversationMigrator {
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        selector: Arc<CredentialSelector>,
        cooldowns: Arc<CooldownTracker>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            transport,
            selector,
            cooldowns,
            config,
        }
    }

    /// 把会话迁到替补凭证名下
    pub async fn migrate(
        &self,
        record: &ConversationRecord,
        owner: &Credential,
        exclude: &HashSet<String>,
    ) -> Result<MigrationOutcome, MigrateError> {
        if owner.status == CredentialStatus::Revoked {
            warn!(
                credential_id = %owner.id,
                conversation_id = %record.conversation_id,
                "原凭证已吊销，迁移直接失败"
            );
            return Err(MigrateError::OwnerRevoked(owner.id.clone()));
        }

        // 第一步：拿到分享引用。仅冷却中的凭证依然可以执行分享，
        // 分享不占用完整的对话容量。
        let share_ref = match &record.share_ref {
            Some(cached) => {
                debug!(conversation_id = %record.conversation_id, "复用缓存的分享引用");
                cached.clone()
            }
            None => self
                .bounded(owner, self.transport.share_conversation(owner, &record.conversation_id))
                .await
                .map_err(MigrateError::ShareFailed)?,
        };

        // 第二步：替补凭证克隆，失败换下一个替补，直到预算耗尽
        let mut attempted: HashSet<String> = exclude.clone();
        attempted.insert(owner.id.clone());

        let max_attempts = 1 + self.config.extra_attempts;
        for attempt in 1..=max_attempts {
            let substitute = match self.selector.select(&attempted).await {
                Ok(credential) => credential,
                Err(SelectError::PoolExhausted) => {
                    warn!(attempt, "替补凭证耗尽，迁移终止");
                    if attempt == 1 {
                        return Err(MigrateError::NoSubstitute);
                    }
                    return Err(MigrateError::AttemptsExhausted { attempts: attempt - 1 });
                }
                Err(e) => return Err(MigrateError::Select(e)),
            };

            let mut grant =
                ShareGrant::new(&owner.id, &substitute.id, &record.conversation_id);

            match self
                .bounded(
                    &substitute,
                    self.transport.clone_conversation(&substitute, &share_ref),
                )
                .await
            {
                Ok(new_conversation_id) => {
                    grant.granted();
                    info!(
                        source = %grant.source_credential_id,
                        target = %grant.target_credential_id,
                        conversation_id = %new_conversation_id,
                        attempt,
                        "会话交接完成"
                    );
                    return Ok(MigrationOutcome {
                        credential: substitute,
                        conversation_id: new_conversation_id,
                        share_ref,
                    });
                }
                Err(e) => {
                    grant.failed();
                    warn!(?grant, attempt, "克隆失败: {e}");
                    attempted.insert(substitute.id);
                }
            }
        }

        Err(MigrateError::AttemptsExhausted {
            attempts: max_attempts,
        })
    }

    /// 带超时执行一次上游调用
    ///
    /// 超时按失败处理（不是"未知"），并给当时使用的凭证标记冷却。
    async fn bounded<T, F>(&self, credential: &Credential, fut: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>> + Send,
    {
        match tokio::time::timeout(self.config.step_timeout(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if let Some(reason) = e.cooldown_reason() {
                    self.cooldowns.mark(&credential.id, reason);
                }
                Err(e)
            }
            Err(_) => {
                self.cooldowns
                    .mark(&credential.id, CooldownReason::TransientError);
                Err(TransportError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConversationHandle;
    use async_trait::async_trait;
    use relaycast_core::ChatMessage;
    use relaycast_credential::{CooldownConfig, CredentialStore};
    use relaycast_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 测试传输：克隆前 N 次失败，分享/克隆均计数
    struct FlakyTransport {
        share_calls: AtomicUsize,
        clone_calls: AtomicUsize,
        clone_failures: usize,
        slow_share: bool,
    }

    impl FlakyTransport {
        fn new(clone_failures: usize) -> Self {
            Self {
                share_calls: AtomicUsize::new(0),
                clone_calls: AtomicUsize::new(0),
                clone_failures,
                slow_share: false,
            }
        }

        fn slow(mut self) -> Self {
            self.slow_share = true;
            self
        }
    }

    #[async_trait]
    impl UpstreamTransport for FlakyTransport {
        async fn start_conversation(
            &self,
            _credential: &Credential,
            _messages: &[ChatMessage],
        ) -> Result<ConversationHandle, TransportError> {
            unimplemented!("迁移测试不会开启新会话")
        }

        async fn continue_conversation(
            &self,
            _credential: &Credential,
            _conversation_id: &str,
            _message: &ChatMessage,
        ) -> Result<String, TransportError> {
            unimplemented!("迁移测试不会续聊")
        }

        async fn share_conversation(
            &self,
            _credential: &Credential,
            conversation_id: &str,
        ) -> Result<String, TransportError> {
            self.share_calls.fetch_add(1, Ordering::SeqCst);
            if self.slow_share {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(format!("share-{conversation_id}"))
        }

        async fn clone_conversation(
            &self,
            credential: &Credential,
            share_ref: &str,
        ) -> Result<String, TransportError> {
            let call = self.clone_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.clone_failures {
                return Err(TransportError::Upstream("clone rejected".to_string()));
            }
            Ok(format!("cloned-{share_ref}-{}", credential.id))
        }
    }

    struct Fixture {
        migrator: ConversationMigrator,
        transport: Arc<FlakyTransport>,
        cooldowns: Arc<CooldownTracker>,
    }

    async fn fixture(pool: &[&str], transport: FlakyTransport, config: MigrationConfig) -> Fixture {
        let store = CredentialStore::new(Arc::new(MemoryStore::new()));
        for id in pool {
            store.upsert(&Credential::new(*id, "secret")).await.unwrap();
        }
        let cooldowns = Arc::new(CooldownTracker::new(CooldownConfig::default()));
        let selector = Arc::new(CredentialSelector::new(store, cooldowns.clone()));
        let transport = Arc::new(transport);
        Fixture {
            migrator: ConversationMigrator::new(
                transport.clone(),
                selector,
                cooldowns.clone(),
                config,
            ),
            transport,
            cooldowns,
        }
    }

    fn owner_record() -> (Credential, ConversationRecord) {
        let owner = Credential::new("owner", "secret");
        let record = ConversationRecord::new("fp1", "owner", "up-1", "resp-1");
        (owner, record)
    }

    #[tokio::test]
    async fn test_migrate_share_then_clone() {
        let f = fixture(
            &["owner", "sub-a"],
            FlakyTransport::new(0),
            MigrationConfig::default(),
        )
        .await;
        let (owner, record) = owner_record();

        let outcome = f
            .migrator
            .migrate(&record, &owner, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(outcome.credential.id, "sub-a");
        assert_eq!(outcome.share_ref, "share-up-1");
        assert!(outcome.conversation_id.starts_with("cloned-share-up-1"));
        assert_eq!(f.transport.share_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_migrate_reuses_cached_share_ref() {
        let f = fixture(
            &["owner", "sub-a"],
            FlakyTransport::new(0),
            MigrationConfig::default(),
        )
        .await;
        let (owner, mut record) = owner_record();
        record.share_ref = Some("share-cached".to_string());

        let outcome = f
            .migrator
            .migrate(&record, &owner, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(outcome.share_ref, "share-cached");
        // 缓存命中，分享步骤被跳过
        assert_eq!(f.transport.share_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_migrate_revoked_owner_fails_fast() {
        let f = fixture(
            &["owner", "sub-a"],
            FlakyTransport::new(0),
            MigrationConfig::default(),
        )
        .await;
        let (mut owner, record) = owner_record();
        owner.status = CredentialStatus::Revoked;

        let err = f
            .migrator
            .migrate(&record, &owner, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::OwnerRevoked(_)));
        assert_eq!(f.transport.share_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_migrate_retries_next_substitute() {
        let f = fixture(
            &["owner", "sub-a", "sub-b"],
            FlakyTransport::new(1),
            MigrationConfig::default(),
        )
        .await;
        let (owner, record) = owner_record();

        let outcome = f
            .migrator
            .migrate(&record, &owner, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(f.transport.clone_calls.load(Ordering::SeqCst), 2);
        // 第一个替补失败后换人成功
        assert!(outcome.credential.id.starts_with("sub-"));
    }

    #[tokio::test]
    async fn test_migrate_budget_exhausted() {
        let f = fixture(
            &["owner", "sub-a", "sub-b", "sub-c"],
            FlakyTransport::new(usize::MAX),
            MigrationConfig {
                extra_attempts: 2,
                ..Default::default()
            },
        )
        .await;
        let (owner, record) = owner_record();

        let err = f
            .migrator
            .migrate(&record, &owner, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrateError::AttemptsExhausted { attempts: 3 }
        ));
        assert_eq!(f.transport.clone_calls.load(Ordering::SeqCst), 3);
        // 克隆被拒不是凭证故障，替补仍然可用（排除只在本次迁移内生效）
        assert!(f.cooldowns.is_usable("sub-a"));
        assert!(f.cooldowns.is_usable("sub-b"));
        assert!(f.cooldowns.is_usable("sub-c"));
    }

    #[tokio::test]
    async fn test_migrate_no_substitute() {
        let f = fixture(&["owner"], FlakyTransport::new(0), MigrationConfig::default()).await;
        let (owner, record) = owner_record();

        let err = f
            .migrator
            .migrate(&record, &owner, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::NoSubstitute));
    }

    #[tokio::test]
    async fn test_share_timeout_marks_owner_cooldown() {
        let f = fixture(
            &["owner", "sub-a"],
            FlakyTransport::new(0).slow(),
            MigrationConfig {
                step_timeout_secs: 0,
                ..Default::default()
            },
        )
        .await;
        let (owner, record) = owner_record();

        let err = f
            .migrator
            .migrate(&record, &owner, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrateError::ShareFailed(TransportError::Timeout)
        ));
        assert!(!f.cooldowns.is_usable("owner"));
    }
}
