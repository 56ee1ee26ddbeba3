//! 会话索引
//!
//! 指纹 → 最近一次已知的上游会话状态。同一指纹至多存在一条
//! 存活记录：`put` 采用无条件覆盖（后写者胜，同历史并发请求的
//! 重复推导是良性的），归属变更走逐指纹的 CAS。记录按最近使用
//! 时间的空闲 TTL 过期，读取时惰性删除。

use chrono::{DateTime, Utc};
use relaycast_storage::{KvStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const KEY_PREFIX: &str = "conversation/";

/// 索引配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// 空闲过期时长（秒），自最近一次使用起算
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    /// 单个凭证名下的存活会话上限，超出淘汰最旧
    #[serde(default = "default_max_per_credential")]
    pub max_per_credential: usize,
}

fn default_idle_ttl_secs() -> u64 {
    72_000 // 20 小时，与上游自身的会话保留期对齐
}
fn default_max_per_credential() -> usize {
    50
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            max_per_credential: default_max_per_credential(),
        }
    }
}

impl IndexConfig {
    fn idle_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_ttl_secs as i64)
    }

    fn store_ttl(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.idle_ttl_secs))
    }
}

/// 会话记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// 指纹（索引键）
    pub fingerprint: String,
    /// 对客户端可见的会话 ID，跨迁移保持不变
    pub session_id: String,
    /// 上游会话 ID
    pub conversation_id: String,
    /// 最近一条上游响应 ID
    pub last_response_id: String,
    /// 归属凭证
    pub credential_id: String,
    /// 最近一次分享引用，迁移时可复用
    #[serde(default)]
    pub share_ref: Option<String>,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(
        fingerprint: impl Into<String>,
        credential_id: impl Into<String>,
        conversation_id: impl Into<String>,
        response_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: fingerprint.into(),
            session_id: new_session_id(),
            conversation_id: conversation_id.into(),
            last_response_id: response_id.into(),
            credential_id: credential_id.into(),
            share_ref: None,
            message_count: 1,
            created_at: now,
            last_used_at: now,
        }
    }

    fn expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_used_at > ttl
    }
}

/// 生成客户端可见的会话 ID
pub(crate) fn new_session_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("conv-{}", &hex[..24])
}

/// 索引统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_conversations: usize,
    pub credentials_with_conversations: usize,
    pub avg_messages_per_conversation: f64,
}

/// 索引错误
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("指纹 {0} 的并发更新冲突")]
    Race(String),

    #[error("会话记录编码错误: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 会话索引
#[derive(Clone)]
pub struct ConversationIndex {
    store: Arc<dyn KvStore>,
    config: IndexConfig,
}

impl ConversationIndex {
    pub fn new(store: Arc<dyn KvStore>, config: IndexConfig) -> Self {
        Self { store, config }
    }

    fn key(fingerprint: &str) -> String {
        format!("{KEY_PREFIX}{fingerprint}")
    }

    /// 读取原始字节与解码结果，CAS 需要前者作为预期值
    async fn load(
        &self,
        fingerprint: &str,
    ) -> Result<Option<(Vec<u8>, ConversationRecord)>, IndexError> {
        match self.store.get(&Self::key(fingerprint)).await? {
            Some(bytes) => {
                let record: ConversationRecord = serde_json::from_slice(&bytes)?;
                Ok(Some((bytes, record)))
            }
            None => Ok(None),
        }
    }

    /// 查找存活记录；过期记录在此处惰性删除
    pub async fn lookup(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ConversationRecord>, IndexError> {
        let Some((_, record)) = self.load(fingerprint).await? else {
            return Ok(None);
        };
        if record.expired(self.config.idle_ttl(), Utc::now()) {
            info!(fingerprint = %fingerprint, session_id = %record.session_id, "会话已过期");
            self.store.delete(&Self::key(fingerprint)).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// 写入记录（无条件覆盖），并收敛归属凭证的会话数量
    pub async fn put(&self, record: ConversationRecord) -> Result<(), IndexError> {
        let credential_id = record.credential_id.clone();
        let bytes = serde_json::to_vec(&record)?;
        self.store
            .set(&Self::key(&record.fingerprint), bytes, self.config.store_ttl())
            .await?;
        debug!(
            fingerprint = %record.fingerprint,
            session_id = %record.session_id,
            conversation_id = %record.conversation_id,
            "会话记录已写入"
        );
        self.enforce_cap(&credential_id).await?;
        Ok(())
    }

    /// 成功回合后的回写
    ///
    /// 记录在查找与回写之间消失时只记日志，调用方下次会按新会话
    /// 处理。同一响应 ID 的重复回写只刷新最近使用时间（幂等）。
    pub async fn touch(&self, fingerprint: &str, response_id: &str) -> Result<(), IndexError> {
        for attempt in 0..2 {
            let Some((raw, mut record)) = self.load(fingerprint).await? else {
                debug!(fingerprint = %fingerprint, "回写时会话记录已不存在");
                return Ok(());
            };

            if record.last_response_id != response_id {
                record.last_response_id = response_id.to_string();
                record.message_count += 1;
            }
            let now = Utc::now();
            if now > record.last_used_at {
                record.last_used_at = now;
            }

            let updated = serde_json::to_vec(&record)?;
            if self
                .store
                .compare_and_swap(
                    &Self::key(fingerprint),
                    Some(&raw),
                    updated,
                    self.config.store_ttl(),
                )
                .await?
            {
                return Ok(());
            }
            debug!(fingerprint = %fingerprint, attempt, "回写 CAS 冲突");
        }
        warn!(fingerprint = %fingerprint, "回写重试后仍冲突，放弃本次回写");
        Ok(())
    }

    /// 迁移成功后的归属变更（逐指纹 CAS，冲突重试一次）
    pub async fn update_owner(
        &self,
        fingerprint: &str,
        credential_id: &str,
        conversation_id: &str,
        share_ref: Option<String>,
    ) -> Result<ConversationRecord, IndexError> {
        for _ in 0..2 {
            let Some((raw, mut record)) = self.load(fingerprint).await? else {
                return Err(IndexError::Race(fingerprint.to_string()));
            };
            record.credential_id = credential_id.to_string();
            record.conversation_id = conversation_id.to_string();
            if share_ref.is_some() {
                record.share_ref = share_ref.clone();
            }
            record.last_used_at = Utc::now();

            let updated = serde_json::to_vec(&record)?;
            if self
                .store
                .compare_and_swap(
                    &Self::key(fingerprint),
                    Some(&raw),
                    updated,
                    self.config.store_ttl(),
                )
                .await?
            {
                info!(
                    fingerprint = %fingerprint,
                    credential_id = %credential_id,
                    conversation_id = %conversation_id,
                    "会话归属已变更"
                );
                return Ok(record);
            }
        }
        Err(IndexError::Race(fingerprint.to_string()))
    }

    /// 移除记录（上游报会话不存在等场景）
    pub async fn invalidate(&self, fingerprint: &str) -> Result<(), IndexError> {
        self.store.delete(&Self::key(fingerprint)).await?;
        info!(fingerprint = %fingerprint, "会话记录已失效");
        Ok(())
    }

    /// 回合结束后把记录迁到新指纹下（存储哈希覆盖了最新一问）
    pub async fn rehash(
        &self,
        old_fingerprint: &str,
        record: ConversationRecord,
    ) -> Result<(), IndexError> {
        let new_fingerprint = record.fingerprint.clone();
        self.put(record).await?;
        if old_fingerprint != new_fingerprint {
            self.store.delete(&Self::key(old_fingerprint)).await?;
            debug!(
                old = %old_fingerprint,
                new = %new_fingerprint,
                "指纹已前移"
            );
        }
        Ok(())
    }

    /// 清扫过期记录，返回清理数量
    pub async fn purge_expired(&self) -> Result<usize, IndexError> {
        let keys = self.store.list(KEY_PREFIX).await?;
        let mut purged = 0;
        for key in keys {
            let fingerprint = &key[KEY_PREFIX.len()..];
            let before = self.load(fingerprint).await?.is_some();
            if before && self.lookup(fingerprint).await?.is_none() {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "已清理过期会话");
        }
        Ok(purged)
    }

    /// 清空全部记录
    pub async fn clear_all(&self) -> Result<(), IndexError> {
        let keys = self.store.list(KEY_PREFIX).await?;
        for key in keys {
            self.store.delete(&key).await?;
        }
        info!("会话索引已清空");
        Ok(())
    }

    /// 统计信息
    pub async fn stats(&self) -> Result<IndexStats, IndexError> {
        let records = self.live_records().await?;
        let total = records.len();
        let mut credentials: Vec<&str> =
            records.iter().map(|r| r.credential_id.as_str()).collect();
        credentials.sort_unstable();
        credentials.dedup();
        let avg = if total == 0 {
            0.0
        } else {
            records.iter().map(|r| r.message_count as f64).sum::<f64>() / total as f64
        };
        Ok(IndexStats {
            total_conversations: total,
            credentials_with_conversations: credentials.len(),
            avg_messages_per_conversation: avg,
        })
    }

    async fn live_records(&self) -> Result<Vec<ConversationRecord>, IndexError> {
        let keys = self.store.list(KEY_PREFIX).await?;
        let now = Utc::now();
        let ttl = self.config.idle_ttl();
        let mut records = Vec::new();
        for key in keys {
            if let Some(bytes) = self.store.get(&key).await? {
                let record: ConversationRecord = serde_json::from_slice(&bytes)?;
                if !record.expired(ttl, now) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// 收敛单凭证名下的会话数量，淘汰最旧记录
    async fn enforce_cap(&self, credential_id: &str) -> Result<(), IndexError> {
        let mut owned: Vec<ConversationRecord> = self
            .live_records()
            .await?
            .into_iter()
            .filter(|r| r.credential_id == credential_id)
            .collect();
        if owned.len() <= self.config.max_per_credential {
            return Ok(());
        }

        owned.sort_by_key(|r| r.last_used_at);
        let excess = owned.len() - self.config.max_per_credential;
        for record in owned.into_iter().take(excess) {
            self.store.delete(&Self::key(&record.fingerprint)).await?;
            info!(
                credential_id = %credential_id,
                session_id = %record.session_id,
                "超出凭证会话上限，淘汰最旧会话"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_storage::MemoryStore;

    fn index_with(config: IndexConfig) -> ConversationIndex {
        ConversationIndex::new(Arc::new(MemoryStore::new()), config)
    }

    fn record(fp: &str, cred: &str) -> ConversationRecord {
        ConversationRecord::new(fp, cred, format!("up-{fp}"), "resp-1")
    }

    #[tokio::test]
    async fn test_put_lookup_invalidate() {
        let index = index_with(IndexConfig::default());
        index.put(record("fp1", "cred-a")).await.unwrap();

        let found = index.lookup("fp1").await.unwrap().unwrap();
        assert_eq!(found.conversation_id, "up-fp1");
        assert_eq!(found.message_count, 1);
        assert!(found.session_id.starts_with("conv-"));

        index.invalidate("fp1").await.unwrap();
        assert!(index.lookup("fp1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_expires_idle_records() {
        let index = index_with(IndexConfig {
            idle_ttl_secs: 0,
            ..Default::default()
        });
        let mut rec = record("fp1", "cred-a");
        rec.last_used_at = Utc::now() - chrono::Duration::seconds(5);
        // 直接写底层，绕过 put 的 TTL，验证读取侧的惰性过期
        let store = index.store.clone();
        store
            .set("conversation/fp1", serde_json::to_vec(&rec).unwrap(), None)
            .await
            .unwrap();

        assert!(index.lookup("fp1").await.unwrap().is_none());
        // 记录已被惰性删除
        assert!(store.get("conversation/fp1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_updates_response_and_count() {
        let index = index_with(IndexConfig::default());
        index.put(record("fp1", "cred-a")).await.unwrap();

        index.touch("fp1", "resp-2").await.unwrap();
        let rec = index.lookup("fp1").await.unwrap().unwrap();
        assert_eq!(rec.last_response_id, "resp-2");
        assert_eq!(rec.message_count, 2);
    }

    #[tokio::test]
    async fn test_touch_same_response_is_idempotent() {
        let index = index_with(IndexConfig::default());
        index.put(record("fp1", "cred-a")).await.unwrap();

        index.touch("fp1", "resp-2").await.unwrap();
        let first = index.lookup("fp1").await.unwrap().unwrap();

        index.touch("fp1", "resp-2").await.unwrap();
        let second = index.lookup("fp1").await.unwrap().unwrap();

        assert_eq!(second.message_count, first.message_count);
        // 最近使用时间单调不减
        assert!(second.last_used_at >= first.last_used_at);
    }

    #[tokio::test]
    async fn test_touch_vanished_record_is_silent() {
        let index = index_with(IndexConfig::default());
        index.touch("ghost", "resp-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_owner_rewrites_record() {
        let index = index_with(IndexConfig::default());
        let original = record("fp1", "cred-a");
        let session_id = original.session_id.clone();
        index.put(original).await.unwrap();

        let updated = index
            .update_owner("fp1", "cred-b", "up-new", Some("share-1".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.credential_id, "cred-b");
        assert_eq!(updated.conversation_id, "up-new");
        assert_eq!(updated.share_ref.as_deref(), Some("share-1"));
        // 客户端可见 ID 跨迁移不变
        assert_eq!(updated.session_id, session_id);
    }

    #[tokio::test]
    async fn test_update_owner_missing_record_is_race() {
        let index = index_with(IndexConfig::default());
        let err = index
            .update_owner("ghost", "cred-b", "up-new", None)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Race(_)));
    }

    #[tokio::test]
    async fn test_rehash_moves_record() {
        let index = index_with(IndexConfig::default());
        index.put(record("fp1", "cred-a")).await.unwrap();

        let mut rec = index.lookup("fp1").await.unwrap().unwrap();
        rec.fingerprint = "fp2".to_string();
        rec.last_response_id = "resp-2".to_string();
        rec.message_count += 1;
        index.rehash("fp1", rec).await.unwrap();

        assert!(index.lookup("fp1").await.unwrap().is_none());
        let moved = index.lookup("fp2").await.unwrap().unwrap();
        assert_eq!(moved.last_response_id, "resp-2");
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest() {
        let index = index_with(IndexConfig {
            max_per_credential: 2,
            ..Default::default()
        });

        let mut oldest = record("fp1", "cred-a");
        oldest.last_used_at = Utc::now() - chrono::Duration::seconds(300);
        index.put(oldest).await.unwrap();
        let mut mid = record("fp2", "cred-a");
        mid.last_used_at = Utc::now() - chrono::Duration::seconds(100);
        index.put(mid).await.unwrap();
        index.put(record("fp3", "cred-a")).await.unwrap();

        assert!(index.lookup("fp1").await.unwrap().is_none());
        assert!(index.lookup("fp2").await.unwrap().is_some());
        assert!(index.lookup("fp3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_counts_expired() {
        let index = index_with(IndexConfig {
            idle_ttl_secs: 60,
            ..Default::default()
        });
        let mut stale = record("fp1", "cred-a");
        stale.last_used_at = Utc::now() - chrono::Duration::seconds(3600);
        index
            .store
            .set("conversation/fp1", serde_json::to_vec(&stale).unwrap(), None)
            .await
            .unwrap();
        index.put(record("fp2", "cred-a")).await.unwrap();

        assert_eq!(index.purge_expired().await.unwrap(), 1);
        assert!(index.lookup("fp2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats() {
        let index = index_with(IndexConfig::default());
        index.put(record("fp1", "cred-a")).await.unwrap();
        index.put(record("fp2", "cred-a")).await.unwrap();
        index.put(record("fp3", "cred-b")).await.unwrap();
        index.touch("fp3", "resp-9").await.unwrap();

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.total_conversations, 3);
        assert_eq!(stats.credentials_with_conversations, 2);
        assert!((stats.avg_messages_per_conversation - 4.0 / 3.0).abs() < 1e-9);

        index.clear_all().await.unwrap();
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.total_conversations, 0);
    }
}
