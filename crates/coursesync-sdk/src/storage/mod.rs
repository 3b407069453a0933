//! 存储模块 - 本地优先的数据持久化层
//!
//! 进度记录以 JSON 形式写入 sled，键为 `progress:{item_id}`。

pub mod kv;

pub use kv::{keys, KvStore};

/// KV 存储统计信息
#[derive(Debug, Clone)]
pub struct KvStats {
    pub key_count: u64,
    pub size_on_disk: u64,
}
