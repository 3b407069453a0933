//! 学习进度模块 - 本地优先的进度存储与防抖同步
//!
//! 每次进度上报先同步写入本地 KV，再由防抖定时器（或完成阈值/显式保存）触发上报，
//! 上报统一经过 `RetryExecutor`。

pub mod api;
pub mod model;
pub mod store;

use serde::{Deserialize, Serialize};

pub use api::{HttpProgressApi, ProgressApi};
pub use model::{ProgressPayload, ProgressRecord};
pub use store::{ItemStatus, ProgressStats, ProgressStore};

/// 单个条目的同步状态（仅内存，不持久化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// 与服务端一致
    #[default]
    Synced,
    /// 有本地修改等待上报（或正在上报）
    Pending,
    /// 上报失败，本地副本保留
    Error,
    /// 网络不可用，恢复后自动上报
    Offline,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Pending => "pending",
            SyncState::Error => "error",
            SyncState::Offline => "offline",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
