//! 会话解析入口
//!
//! 每个请求在派发上游前必须落入三个终态之一：
//! 全新会话（Fresh）、原凭证续聊（Continued）、迁移后续聊（Migrated）。
//!
//! 同指纹的请求经由逐指纹的异步锁串行化：锁由返回的
//! [`ResolvedSession`] 持有，调用方完成回合回写（或放弃）后释放，
//! 因此携带相同历史的并发请求只会开启一个上游会话，其余请求
//! 会看到先行者写下的记录。不同指纹之间完全不竞争。
//!
//! 迁移失败、索引竞争都在这里就地吸收为"回退到全新会话"；
//! 只有凭证池耗尽是对调用方可见的硬错误。

use crate::fingerprint::{lookup_fingerprint, store_fingerprint};
use crate::index::{self, ConversationIndex, ConversationRecord, IndexConfig, IndexError, IndexStats};
use crate::migration::{ConversationMigrator, MigrationConfig};
use crate::transport::UpstreamTransport;
use chrono::Utc;
use dashmap::DashMap;
use relaycast_core::ChatMessage;
use relaycast_credential::{
    CooldownConfig, CooldownReason, CooldownTracker, Credential, CredentialSelector,
    CredentialStatus, CredentialStore, CredentialStoreError, SelectError,
};
use relaycast_storage::KvStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// 锁注册表超过此规模时顺手清理空闲锁
const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// 解析配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// 请求终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// 全新上游会话
    Fresh,
    /// 原凭证直接续聊
    Continued,
    /// 已迁移到替补凭证名下续聊
    Migrated,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fresh => "fresh",
            Self::Continued => "continued",
            Self::Migrated => "migrated",
        };
        f.write_str(s)
    }
}

/// 解析结果
///
/// 持有所属指纹的串行化锁；完成回合回写后丢弃本对象即释放。
pub struct ResolvedSession {
    pub mode: SessionMode,
    /// 本次请求应使用的凭证
    pub credential: Credential,
    /// 续聊时的上游会话 ID（全新会话为 None）
    pub conversation_id: Option<String>,
    /// 续聊时的最近响应 ID（全新会话与刚迁移的会话为 None）
    pub last_response_id: Option<String>,
    /// 客户端可见会话 ID
    pub session_id: String,
    lookup_fp: Option<String>,
    store_fp: Option<String>,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for ResolvedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSession")
            .field("mode", &self.mode)
            .field("credential", &self.credential.id)
            .field("conversation_id", &self.conversation_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// 一个成功回合的上游结果，用于回写索引
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub response_id: String,
    /// 本回合若产生/使用了分享引用则带上
    pub share_ref: Option<String>,
}

/// 解析错误
///
/// 只有池耗尽与存储故障会到达调用方；迁移失败与索引竞争
/// 都已就地回退。
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Select(#[from] SelectError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Credential(#[from] CredentialStoreError),
}

impl ResolveError {
    /// 是否为凭证池耗尽（对用户可见的终态错误）
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::Select(SelectError::PoolExhausted))
    }
}

/// 会话解析器
pub struct SessionResolver {
    index: ConversationIndex,
    credentials: CredentialStore,
    cooldowns: Arc<CooldownTracker>,
    selector: Arc<CredentialSelector>,
    migrator: ConversationMigrator,
    /// 逐指纹串行化锁
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionResolver {
    pub fn new(
        store: Arc<dyn KvStore>,
        transport: Arc<dyn UpstreamTransport>,
        config: ResolverConfig,
    ) -> Self {
        let credentials = CredentialStore::new(store.clone());
        let cooldowns = Arc::new(CooldownTracker::new(config.cooldown));
        let selector = Arc::new(CredentialSelector::new(
            credentials.clone(),
            cooldowns.clone(),
        ));
        let migrator = ConversationMigrator::new(
            transport,
            selector.clone(),
            cooldowns.clone(),
            config.migration,
        );
        Self {
            index: ConversationIndex::new(store, config.index),
            credentials,
            cooldowns,
            selector,
            migrator,
            locks: DashMap::new(),
        }
    }

    /// 凭证存储（注册、吊销等管理操作由外部通过它进行）
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// 冷却跟踪器
    pub fn cooldowns(&self) -> &Arc<CooldownTracker> {
        &self.cooldowns
    }

    /// 解析一次请求
    pub async fn resolve(
        &self,
        messages: &[ChatMessage],
    ) -> Result<ResolvedSession, ResolveError> {
        let lookup_fp = lookup_fingerprint(messages);
        let store_fp = store_fingerprint(messages);

        let guard = match &lookup_fp {
            Some(fp) => Some(self.fingerprint_lock(fp).lock_owned().await),
            None => None,
        };

        if let Some(fp) = lookup_fp.clone() {
            if let Some(record) = self.index.lookup(&fp).await? {
                return self.resolve_hit(&fp, record, lookup_fp, store_fp, guard).await;
            }
        }

        debug!("指纹未命中，开启全新会话");
        self.fresh(&HashSet::new(), lookup_fp, store_fp, guard).await
    }

    /// 命中已有记录：续用或迁移
    async fn resolve_hit(
        &self,
        fp: &str,
        record: ConversationRecord,
        lookup_fp: Option<String>,
        store_fp: Option<String>,
        guard: Option<OwnedMutexGuard<()>>,
    ) -> Result<ResolvedSession, ResolveError> {
        let owner = self.credentials.get(&record.credential_id).await?;

        if let Some(owner) = &owner {
            // 存储里的状态只是参考；吊销/耗尽硬性排除，
            // 冷却与否以跟踪器为准
            let usable = owner.is_selectable() && self.cooldowns.is_usable(&owner.id);
            if usable {
                info!(
                    fingerprint = %fp,
                    session_id = %record.session_id,
                    credential_id = %owner.id,
                    "自动识别会话，续用原凭证"
                );
                return Ok(ResolvedSession {
                    mode: SessionMode::Continued,
                    credential: owner.clone(),
                    conversation_id: Some(record.conversation_id.clone()),
                    last_response_id: Some(record.last_response_id.clone()),
                    session_id: record.session_id.clone(),
                    lookup_fp,
                    store_fp,
                    _guard: guard,
                });
            }
        }

        let owner_id = record.credential_id.clone();
        let exclude: HashSet<String> = [owner_id.clone()].into();

        let Some(owner) = owner else {
            // 凭证记录已不存在，视同吊销：无法分享，直接回退
            warn!(
                fingerprint = %fp,
                credential_id = %owner_id,
                "归属凭证已不存在，放弃原会话"
            );
            self.index.invalidate(fp).await?;
            return self.fresh(&exclude, lookup_fp, store_fp, guard).await;
        };

        match self.migrator.migrate(&record, &owner, &HashSet::new()).await {
            Ok(outcome) => {
                match self
                    .index
                    .update_owner(
                        fp,
                        &outcome.credential.id,
                        &outcome.conversation_id,
                        Some(outcome.share_ref.clone()),
                    )
                    .await
                {
                    Ok(updated) => {
                        info!(
                            fingerprint = %fp,
                            session_id = %updated.session_id,
                            from = %owner_id,
                            to = %outcome.credential.id,
                            "会话已迁移到替补凭证"
                        );
                        Ok(ResolvedSession {
                            mode: SessionMode::Migrated,
                            credential: outcome.credential,
                            conversation_id: Some(outcome.conversation_id),
                            last_response_id: None,
                            session_id: updated.session_id,
                            lookup_fp,
                            store_fp,
                            _guard: guard,
                        })
                    }
                    Err(IndexError::Race(_)) => {
                        // 重试后仍冲突：按新会话处理
                        warn!(fingerprint = %fp, "归属变更持续冲突，回退到全新会话");
                        self.index.invalidate(fp).await?;
                        self.fresh(&exclude, lookup_fp, store_fp, guard).await
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => {
                info!(
                    fingerprint = %fp,
                    credential_id = %owner_id,
                    "迁移失败，回退到全新会话: {e}"
                );
                self.index.invalidate(fp).await?;
                self.fresh(&exclude, lookup_fp, store_fp, guard).await
            }
        }
    }

    /// 全新会话：选凭证并预分配客户端会话 ID
    async fn fresh(
        &self,
        exclude: &HashSet<String>,
        lookup_fp: Option<String>,
        store_fp: Option<String>,
        guard: Option<OwnedMutexGuard<()>>,
    ) -> Result<ResolvedSession, ResolveError> {
        let credential = self.selector.select(exclude).await?;
        debug!(credential_id = %credential.id, "全新会话已就绪");
        Ok(ResolvedSession {
            mode: SessionMode::Fresh,
            credential,
            conversation_id: None,
            last_response_id: None,
            session_id: index::new_session_id(),
            lookup_fp,
            store_fp,
            _guard: guard,
        })
    }

    /// 成功回合后的回写
    ///
    /// 全新会话写入新记录；续聊把记录前移到覆盖最新一问的指纹下。
    /// 同一响应 ID 的重复回写只刷新最近使用时间。
    pub async fn record_turn(
        &self,
        session: &ResolvedSession,
        outcome: &TurnOutcome,
    ) -> Result<(), ResolveError> {
        let Some(new_fp) = &session.store_fp else {
            debug!(session_id = %session.session_id, "无可存储指纹，跳过回合记录");
            return Ok(());
        };

        // 幂等：同一响应重复上报只刷新时间
        if let Some(existing) = self.index.lookup(new_fp).await? {
            if existing.last_response_id == outcome.response_id {
                self.index.touch(new_fp, &outcome.response_id).await?;
                return Ok(());
            }
        }

        match session.mode {
            SessionMode::Fresh => {
                let mut record = ConversationRecord::new(
                    new_fp.clone(),
                    &session.credential.id,
                    &outcome.conversation_id,
                    &outcome.response_id,
                );
                record.session_id = session.session_id.clone();
                record.share_ref = outcome.share_ref.clone();
                self.index.put(record).await?;
            }
            SessionMode::Continued | SessionMode::Migrated => {
                let Some(old_fp) = &session.lookup_fp else {
                    debug!(session_id = %session.session_id, "缺少查找指纹，按全新会话记录");
                    let mut record = ConversationRecord::new(
                        new_fp.clone(),
                        &session.credential.id,
                        &outcome.conversation_id,
                        &outcome.response_id,
                    );
                    record.session_id = session.session_id.clone();
                    self.index.put(record).await?;
                    return Ok(());
                };

                match self.index.lookup(old_fp).await? {
                    Some(mut record) => {
                        record.fingerprint = new_fp.clone();
                        record.last_response_id = outcome.response_id.clone();
                        record.message_count += 1;
                        record.last_used_at = Utc::now();
                        record.credential_id = session.credential.id.clone();
                        record.conversation_id = outcome.conversation_id.clone();
                        if outcome.share_ref.is_some() {
                            record.share_ref = outcome.share_ref.clone();
                        }
                        self.index.rehash(old_fp, record).await?;
                    }
                    None => {
                        // 记录在回合期间消失：只记日志，后续请求按新会话处理
                        warn!(
                            session_id = %session.session_id,
                            fingerprint = %old_fp,
                            "回合期间会话记录消失"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// 上游报会话不存在时，移除对应记录
    pub async fn invalidate_session(&self, fingerprint: &str) -> Result<(), ResolveError> {
        self.index.invalidate(fingerprint).await?;
        Ok(())
    }

    /// 记录一次凭证层面的失败
    ///
    /// 标记冷却，并把参考状态同步进凭证存储（尽力而为）。
    pub async fn record_failure(&self, credential_id: &str, reason: CooldownReason) {
        self.cooldowns.mark(credential_id, reason);
        let status = match reason {
            CooldownReason::QuotaExhausted => CredentialStatus::Exhausted,
            CooldownReason::RateLimited | CooldownReason::TransientError => {
                CredentialStatus::CoolingDown
            }
        };
        self.credentials.apply_status(credential_id, status).await;
    }

    /// 清扫过期会话记录
    pub async fn purge_expired(&self) -> Result<usize, ResolveError> {
        Ok(self.index.purge_expired().await?)
    }

    /// 索引统计
    pub async fn stats(&self) -> Result<IndexStats, ResolveError> {
        Ok(self.index.stats().await?)
    }

    /// 清空全部会话记录
    pub async fn clear_all(&self) -> Result<(), ResolveError> {
        Ok(self.index.clear_all().await?)
    }

    fn fingerprint_lock(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        if self.locks.len() > LOCK_PRUNE_THRESHOLD {
            // 仅保留仍被持有的锁
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        self.locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
