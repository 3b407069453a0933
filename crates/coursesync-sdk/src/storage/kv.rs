//! KV 存储模块 - 基于 sled 的本地持久化
//!
//! 本模块提供：
//! - 命名空间隔离（每个命名空间一棵 Tree）
//! - 同步写入：写入返回即已落盘，重启后可读
//! - 损坏数据容错：读取到无法解析的值时视为不存在

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, warn};

use crate::error::{CourseSyncError, Result};
use crate::storage::KvStats;

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    base_path: Option<PathBuf>,
    db: Db,
    tree: Tree,
    /// 每次写入后是否立即 flush
    durable_writes: bool,
}

impl KvStore {
    /// 在 `base_path/kv` 下打开 KV 存储
    pub async fn open(base_path: &Path, namespace: &str) -> Result<Self> {
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| CourseSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个进程/实例可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut last_err: Option<sled::Error> = None;
        let mut db_opt: Option<Db> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    db_opt = Some(db);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            CourseSyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree = db
            .open_tree(namespace)
            .map_err(|e| CourseSyncError::KvStore(format!("打开 Tree 失败: {}", e)))?;

        tracing::info!("KV 存储已打开: {} (namespace={})", kv_path.display(), namespace);

        Ok(Self {
            base_path: Some(base_path.to_path_buf()),
            db,
            tree,
            durable_writes: true,
        })
    }

    /// 临时存储（进程退出即删除），用于测试和无持久化场景
    pub fn temporary(namespace: &str) -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| CourseSyncError::KvStore(format!("打开临时 sled 失败: {}", e)))?;
        let tree = db
            .open_tree(namespace)
            .map_err(|e| CourseSyncError::KvStore(format!("打开 Tree 失败: {}", e)))?;
        Ok(Self {
            base_path: None,
            db,
            tree,
            durable_writes: false,
        })
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    /// 设置键值对（JSON 序列化）
    pub fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| CourseSyncError::Serialization(format!("序列化值失败: {}", e)))?;
        self.set_raw(key, value_bytes)
    }

    /// 写入原始字节
    pub fn set_raw<K, B>(&self, key: K, bytes: B) -> Result<()>
    where
        K: AsRef<[u8]>,
        B: Into<sled::IVec>,
    {
        self.tree
            .insert(key, bytes)
            .map_err(|e| CourseSyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        if self.durable_writes {
            self.tree
                .flush()
                .map_err(|e| CourseSyncError::KvStore(format!("flush 失败: {}", e)))?;
        }
        Ok(())
    }

    /// 获取键值对，值无法解析时返回错误
    pub fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        match self.tree.get(key)? {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| CourseSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 获取键值对，损坏的值视为不存在
    pub fn get_lenient<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let key = key.as_ref();
        match self.tree.get(key)? {
            Some(value_bytes) => match serde_json::from_slice(&value_bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(
                        "⚠️ 本地数据损坏，按不存在处理: key={}, error={}",
                        String::from_utf8_lossy(key),
                        e
                    );
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// 删除键值对
    pub fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let removed = self
            .tree
            .remove(key)
            .map_err(|e| CourseSyncError::KvStore(format!("删除键值对失败: {}", e)))?;
        if self.durable_writes {
            self.tree.flush()?;
        }
        Ok(removed.is_some())
    }

    pub fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        self.tree
            .contains_key(key)
            .map_err(|e| CourseSyncError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 获取指定前缀的所有键值对（跳过损坏的值）
    pub fn scan_prefix<V>(&self, prefix: &str) -> Result<Vec<(String, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();
        for entry in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, value_bytes) =
                entry.map_err(|e| CourseSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            let key = String::from_utf8_lossy(&key).into_owned();
            match serde_json::from_slice(&value_bytes) {
                Ok(value) => results.push((key, value)),
                Err(e) => debug!("跳过无法解析的值: key={}, error={}", key, e),
            }
        }
        Ok(results)
    }

    /// 获取指定前缀的所有键
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for key in self.tree.scan_prefix(prefix.as_bytes()).keys() {
            let key = key.map_err(|e| CourseSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    /// 强制落盘
    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }

    /// 获取统计信息
    pub fn stats(&self) -> Result<KvStats> {
        Ok(KvStats {
            key_count: self.tree.len() as u64,
            size_on_disk: self.db.size_on_disk()?,
        })
    }
}

/// 常用的键前缀
pub mod keys {
    /// 进度记录：progress:{item_id}
    pub const PROGRESS: &str = "progress:";
    /// 待同步标记：progress-pending:{item_id}
    pub const PROGRESS_PENDING: &str = "progress-pending:";

    pub fn progress(item_id: &str) -> String {
        format!("{}{}", PROGRESS, item_id)
    }

    pub fn progress_pending(item_id: &str) -> String {
        format!("{}{}", PROGRESS_PENDING, item_id)
    }
}
