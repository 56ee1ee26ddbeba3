//! 内存键值存储
//!
//! 测试与单进程部署使用的参考后端。过期采用读时惰性删除，
//! CAS 通过 DashMap 的 entry 锁保证逐键原子性。

use crate::kv::{KvStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn expires_at(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expired(now) {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Self::expires_at(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let stored = StoredValue {
            value: new,
            expires_at: Self::expires_at(ttl),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                // 过期键视同不存在
                let current = if occupied.get().expired(now) {
                    None
                } else {
                    Some(occupied.get().value.as_slice())
                };
                if current == expected {
                    occupied.insert(stored);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(stored);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().expired(now))
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
