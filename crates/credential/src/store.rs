//! 凭证存储
//!
//! 键值契约之上的类型化层。状态变更一律走 `update_atomic` 的
//! CAS 读改写循环，避免并发选取下的丢失更新。

use crate::types::{Credential, CredentialStatus};
use chrono::Utc;
use relaycast_storage::{KvStore, StoreError};
use std::sync::Arc;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "credential/";

/// CAS 冲突重试上限
const MAX_CAS_RETRIES: usize = 5;

/// 凭证存储错误
#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("凭证不存在: {0}")]
    NotFound(String),

    #[error("凭证 {0} 并发更新冲突，重试已耗尽")]
    Conflict(String),

    #[error("凭证编码错误: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 凭证存储
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KvStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(id: &str) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    /// 读取单个凭证
    pub async fn get(&self, id: &str) -> Result<Option<Credential>, CredentialStoreError> {
        match self.store.get(&Self::key(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// 列出全部凭证，按 id 排序保证轮询顺序稳定
    pub async fn list(&self) -> Result<Vec<Credential>, CredentialStoreError> {
        let keys = self.store.list(KEY_PREFIX).await?;
        let mut credentials = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = self.store.get(&key).await? {
                credentials.push(serde_json::from_slice::<Credential>(&bytes)?);
            }
        }
        credentials.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(credentials)
    }

    /// 写入（覆盖）凭证
    pub async fn upsert(&self, credential: &Credential) -> Result<(), CredentialStoreError> {
        let bytes = serde_json::to_vec(credential)?;
        self.store.set(&Self::key(&credential.id), bytes, None).await?;
        Ok(())
    }

    /// 删除凭证
    pub async fn remove(&self, id: &str) -> Result<(), CredentialStoreError> {
        self.store.delete(&Self::key(id)).await?;
        Ok(())
    }

    /// 原子读改写
    ///
    /// 读出当前值、应用变更、以原值为预期做 CAS；冲突时重读重试，
    /// 超过重试上限返回 Conflict。返回更新后的凭证。
    pub async fn update_atomic<F>(
        &self,
        id: &str,
        mut apply: F,
    ) -> Result<Credential, CredentialStoreError>
    where
        F: FnMut(&mut Credential) + Send,
    {
        let key = Self::key(id);
        for _ in 0..MAX_CAS_RETRIES {
            let Some(current) = self.store.get(&key).await? else {
                return Err(CredentialStoreError::NotFound(id.to_string()));
            };
            let mut credential: Credential = serde_json::from_slice(&current)?;
            apply(&mut credential);
            let updated = serde_json::to_vec(&credential)?;

            if self
                .store
                .compare_and_swap(&key, Some(&current), updated, None)
                .await?
            {
                return Ok(credential);
            }
            debug!(credential_id = %id, "凭证 CAS 冲突，重试");
        }
        Err(CredentialStoreError::Conflict(id.to_string()))
    }

    /// 参考状态变更（尽力而为）
    ///
    /// 状态仅作参考信息，失败只记日志，绝不阻塞调用方。
    pub async fn apply_status(&self, id: &str, status: CredentialStatus) {
        let result = self
            .update_atomic(id, |credential| credential.status = status)
            .await;
        match result {
            Ok(_) => debug!(credential_id = %id, ?status, "凭证状态已更新"),
            Err(e) => warn!(credential_id = %id, ?status, "凭证状态更新失败: {e}"),
        }
    }

    /// 选取后的使用计数更新（乐观，最终一致即可）
    pub async fn mark_used(&self, id: &str) -> Result<Credential, CredentialStoreError> {
        self.update_atomic(id, |credential| {
            credential.use_count += 1;
            credential.last_used_at = Some(Utc::now());
        })
        .await
    }
}
