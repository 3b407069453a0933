//! 事件系统模块 - 处理同步引擎中的各种事件
//!
//! 功能包括：
//! - 长连接状态变更事件（connection_status）
//! - 重连调度 / 重连耗尽事件
//! - 进度同步状态变更事件
//! - 通知队列变更事件
//! - 事件广播和订阅机制

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connection::notification::Notification;
use crate::connection::ConnectionStatus;
use crate::progress::SyncState;

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 连接状态变更
    ConnectionStatusChanged {
        old_status: ConnectionStatus,
        new_status: ConnectionStatus,
        reason: Option<String>,
        timestamp: i64,
    },
    /// 已安排下一次重连
    ReconnectScheduled {
        attempt: u32,
        delay_ms: u64,
        timestamp: i64,
    },
    /// 自动重连次数耗尽，需要用户手动重试
    MaxReconnectAttemptsReached { attempts: u32, timestamp: i64 },
    /// 单个条目的进度同步状态变更
    ProgressSyncStateChanged {
        item_id: String,
        old_state: SyncState,
        new_state: SyncState,
        error: Option<String>,
        timestamp: i64,
    },
    /// 新通知入队
    NotificationReceived(Notification),
    /// 通知队列变化（已读/清空/入队）
    NotificationsChanged {
        total: usize,
        unread: usize,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ConnectionStatusChanged { .. } => "connection_status_changed",
            SyncEvent::ReconnectScheduled { .. } => "reconnect_scheduled",
            SyncEvent::MaxReconnectAttemptsReached { .. } => "max_reconnect_attempts_reached",
            SyncEvent::ProgressSyncStateChanged { .. } => "progress_sync_state_changed",
            SyncEvent::NotificationReceived(_) => "notification_received",
            SyncEvent::NotificationsChanged { .. } => "notifications_changed",
        }
    }

    /// 获取事件关联的条目ID
    pub fn item_id(&self) -> Option<&str> {
        match self {
            SyncEvent::ProgressSyncStateChanged { item_id, .. } => Some(item_id),
            _ => None,
        }
    }

    /// 获取事件时间戳（毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::ConnectionStatusChanged { timestamp, .. } => *timestamp,
            SyncEvent::ReconnectScheduled { timestamp, .. } => *timestamp,
            SyncEvent::MaxReconnectAttemptsReached { timestamp, .. } => *timestamp,
            SyncEvent::ProgressSyncStateChanged { timestamp, .. } => *timestamp,
            SyncEvent::NotificationReceived(notification) => notification.timestamp.timestamp_millis(),
            SyncEvent::NotificationsChanged { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 条目ID过滤器
    pub item_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_item_ids(mut self, item_ids: Vec<String>) -> Self {
        self.item_ids = Some(item_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref item_ids) = self.item_ids {
            match event.item_id() {
                Some(item_id) => {
                    if !item_ids.iter().any(|id| id == item_id) {
                        return false;
                    }
                }
                // 事件没有条目ID但过滤器要求有
                None => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// 监听器句柄，用于移除监听器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SyncEvent>,
    /// 事件监听器映射（"*" 表示监听全部）
    listeners: RwLock<HashMap<String, Vec<(ListenerId, EventListener)>>>,
    next_listener_id: AtomicU64,
    /// 事件统计
    stats: RwLock<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    ///
    /// 监听器在锁外调用，监听器内部可以继续注册/移除监听器。
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let targets: Vec<EventListener> = {
            let listeners = self.listeners.read();
            listeners
                .get(event.event_type())
                .into_iter()
                .chain(listeners.get("*"))
                .flat_map(|entries| entries.iter().map(|(_, listener)| listener.clone()))
                .collect()
        };
        for listener in targets {
            listener(&event);
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器
    pub fn add_listener<F>(&self, event_type: &str, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        let mut listeners = self.listeners.write();
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(listener)));

        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();
        info!("Added listener for event type: {}", event_type);
        id
    }

    /// 移除单个监听器
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(listener_id, _)| *listener_id != id);
            removed |= entries.len() != before;
        }
        listeners.retain(|_, entries| !entries.is_empty());
        self.stats.write().listener_count = listeners.values().map(|v| v.len()).sum();
        removed
    }

    /// 移除所有监听器
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256)
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn connection_status_changed(
        old_status: ConnectionStatus,
        new_status: ConnectionStatus,
        reason: Option<String>,
    ) -> SyncEvent {
        SyncEvent::ConnectionStatusChanged {
            old_status,
            new_status,
            reason,
            timestamp: now_millis(),
        }
    }

    pub fn reconnect_scheduled(attempt: u32, delay_ms: u64) -> SyncEvent {
        SyncEvent::ReconnectScheduled {
            attempt,
            delay_ms,
            timestamp: now_millis(),
        }
    }

    pub fn max_reconnect_attempts_reached(attempts: u32) -> SyncEvent {
        SyncEvent::MaxReconnectAttemptsReached {
            attempts,
            timestamp: now_millis(),
        }
    }

    pub fn progress_sync_state_changed(
        item_id: &str,
        old_state: SyncState,
        new_state: SyncState,
        error: Option<String>,
    ) -> SyncEvent {
        SyncEvent::ProgressSyncStateChanged {
            item_id: item_id.to_string(),
            old_state,
            new_state,
            error,
            timestamp: now_millis(),
        }
    }

    pub fn notifications_changed(total: usize, unread: usize) -> SyncEvent {
        SyncEvent::NotificationsChanged {
            total,
            unread,
            timestamp: now_millis(),
        }
    }
}
