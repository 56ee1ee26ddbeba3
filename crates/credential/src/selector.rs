//! 凭证选取
//!
//! 从上次选中的位置之后开始轮询，跳过吊销/耗尽、冷却中以及
//! 排除集内的凭证。多个候选同时合格时，使用次数最少者胜出，
//! 次数相同按轮询顺序。池耗尽是对调用方可见的硬错误，
//! 不做静默的无限重试。

use crate::cooldown::CooldownTracker;
use crate::store::{CredentialStore, CredentialStoreError};
use crate::types::Credential;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// 选取错误
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("凭证池已耗尽，没有可用凭证")]
    PoolExhausted,

    #[error(transparent)]
    Store(#[from] CredentialStoreError),
}

/// 纯函数扫描：从 `start_after` 之后按轮询顺序找出合格候选
///
/// 返回 (候选下标, 候选引用)。合格者中使用次数严格更少的胜出，
/// 否则保持先到先得的轮询顺序。不依赖共享可变游标，便于单测。
fn scan<'a, F>(
    candidates: &'a [Credential],
    start_after: usize,
    mut eligible: F,
) -> Option<(usize, &'a Credential)>
where
    F: FnMut(&Credential) -> bool,
{
    let len = candidates.len();
    if len == 0 {
        return None;
    }

    let mut best: Option<(usize, &Credential)> = None;
    for offset in 0..len {
        let idx = (start_after + 1 + offset) % len;
        let candidate = &candidates[idx];
        if !eligible(candidate) {
            continue;
        }
        match best {
            Some((_, current)) if candidate.use_count >= current.use_count => {}
            _ => best = Some((idx, candidate)),
        }
    }
    best
}

/// 凭证选取器
pub struct CredentialSelector {
    store: CredentialStore,
    cooldowns: Arc<CooldownTracker>,
    /// 上次选中的下标（轮询起点）
    cursor: AtomicUsize,
}

impl CredentialSelector {
    pub fn new(store: CredentialStore, cooldowns: Arc<CooldownTracker>) -> Self {
        Self {
            store,
            cooldowns,
            cursor: AtomicUsize::new(0),
        }
    }

    /// 选取一个可用凭证
    ///
    /// 选中后乐观更新使用计数与最近使用时间；计数更新失败不影响
    /// 本次选取结果（最终一致即可）。
    pub async fn select(
        &self,
        exclude: &HashSet<String>,
    ) -> Result<Credential, SelectError> {
        let candidates = self.store.list().await?;
        let start_after = self.cursor.load(Ordering::Relaxed);

        let found = scan(&candidates, start_after, |c| {
            c.is_selectable() && self.cooldowns.is_usable(&c.id) && !exclude.contains(&c.id)
        });

        let Some((idx, selected)) = found else {
            warn!(
                pool_size = candidates.len(),
                excluded = exclude.len(),
                "凭证池耗尽，无合格候选"
            );
            return Err(SelectError::PoolExhausted);
        };

        self.cursor.store(idx, Ordering::Relaxed);
        debug!(credential_id = %selected.id, index = idx, "轮询选中凭证");

        match self.store.mark_used(&selected.id).await {
            Ok(updated) => Ok(updated),
            Err(e) => {
                warn!(credential_id = %selected.id, "使用计数更新失败: {e}");
                Ok(selected.clone())
            }
        }
    }
}
