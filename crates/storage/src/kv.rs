//! 键值持久化契约
//!
//! `compare_and_swap` 是指纹级临界区的基础：所有记录变更都表达为
//! 逐键原子操作，因此任何不支持多键事务的后端也能承载。

use async_trait::async_trait;
use std::time::Duration;

/// 存储错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("存储后端错误: {0}")]
    Backend(String),

    #[error("键值编码错误: {0}")]
    Encoding(String),
}

/// 键值存储契约
///
/// `set` 的 TTL 为可选项；传 None 表示不过期。过期由后端负责，
/// 读到过期键应当返回 None。
#[async_trait]
pub trait KvStore: Send + Sync {
    /// 读取键值，不存在或已过期返回 None
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// 写入键值，可附带过期时间
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    /// 删除键，键不存在不算错误
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// 原子比较并交换
    ///
    /// `expected` 为 None 表示"键必须不存在"。当前值与预期一致时写入
    /// 新值并返回 true，否则不做任何修改返回 false。
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// 列出指定前缀下的所有键
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
