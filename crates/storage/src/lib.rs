//! 存储抽象模块
//!
//! 定义核心依赖的键值持久化契约，以及一个内存参考实现。
//! 具体后端（本地文件、缓存、数据库）由外部驱动提供，
//! 只要满足逐键原子操作即可，不要求多键事务。

pub mod kv;
pub mod memory;

pub use kv::{KvStore, StoreError};
pub use memory::MemoryStore;
