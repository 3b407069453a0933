use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

/// 网络状态监听器trait（由平台层实现，如浏览器 online/offline 事件、移动端网络回调）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Option<Arc<dyn NetworkStatusListener>>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
    monitor_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let mut monitor = Self::manual(NetworkStatus::Online);
        monitor.listener = Some(listener);
        monitor
    }

    /// 不接平台监听器，由调用方通过 set_status 手动驱动
    pub fn manual(initial: NetworkStatus) -> Self {
        let (status_sender, _) = broadcast::channel(100);
        Self {
            listener: None,
            status_sender,
            current_status: Arc::new(RwLock::new(initial)),
            monitor_task: parking_lot::Mutex::new(None),
        }
    }

    /// 启动网络监控
    pub async fn start(&self) -> Result<()> {
        let listener = match &self.listener {
            Some(listener) => listener.clone(),
            None => return Ok(()),
        };

        *self.current_status.write() = listener.get_current_status().await;
        let mut receiver = listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        *current_status.write() = event.new_status;
                        let _ = status_sender.send(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("网络状态事件积压，跳过 {} 条", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.monitor_task.lock().replace(handle) {
            previous.abort();
        }

        info!("网络监控已启动");
        Ok(())
    }

    /// 停止网络监控
    pub async fn stop(&self) {
        if let Some(handle) = self.monitor_task.lock().take() {
            handle.abort();
        }
        if let Some(listener) = &self.listener {
            listener.stop_monitoring().await;
        }
    }

    /// 获取当前网络状态
    pub fn get_status(&self) -> NetworkStatus {
        *self.current_status.read()
    }

    pub fn is_online(&self) -> bool {
        self.get_status().is_online()
    }

    /// 手动设置网络状态，状态未变化时不广播
    pub fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write();
            let old = *status;
            *status = new_status;
            old
        };
        if old_status == new_status {
            return;
        }

        info!("网络状态变化: {:?} -> {:?}", old_status, new_status);
        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let _ = self.status_sender.send(event);
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor_task.lock().take() {
            handle.abort();
        }
    }
}


#[cfg(test)]
pub use test_helpers::DummyNetworkStatusListener;
