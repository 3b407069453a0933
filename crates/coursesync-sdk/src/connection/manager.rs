//! 长连接管理器
//!
//! 状态机：`Disconnected → Connecting → Connected`，断线后 `Connected → Reconnecting → Connected | Disconnected`。
//!
//! - `start()` 建立连接并在断线后按指数退避重连，连续失败达到上限后发出
//!   `MaxReconnectAttemptsReached` 并停止，由用户通过 `reconnect()` 手动重试
//! - `stop()` 同步拆除：取消重连循环、清空所有处理器，之后不会再投递任何消息
//! - 入站消息依次投递给原始类型的订阅者、`data.type` 的订阅者，
//!   属于通知类型的再转换成通知放入有界队列

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::notification::{Notification, NotificationQueue};
use crate::connection::transport::{
    DisconnectReason, InboundMessage, OutboundMessage, PushTransport, TransportEvent,
};
use crate::connection::ConnectionStatus;
use crate::error::{CourseSyncError, Result};
use crate::events::{event_builders, EventManager, SyncEvent};
use crate::lifecycle::LifecycleHook;

/// 消息处理器
pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// 订阅者角色，决定订阅的支付频道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerRole {
    Teacher,
    Student,
}

impl ConsumerRole {
    /// 出站订阅消息里的频道名（`subscribe_{kind}`）
    pub fn channel_kind(&self) -> &'static str {
        match self {
            ConsumerRole::Teacher => "teacher_payments",
            ConsumerRole::Student => "student_payments",
        }
    }

    pub fn topic(&self, consumer_id: &str) -> String {
        match self {
            ConsumerRole::Teacher => format!("teacher-payments:{}", consumer_id),
            ConsumerRole::Student => format!("student-payments:{}", consumer_id),
        }
    }
}

struct RoleSubscription {
    role: ConsumerRole,
    consumer_id: String,
}

/// 订阅句柄
///
/// 同一处理器重复订阅同一主题时返回的句柄指向同一条注册，任意一个句柄都可以取消。
pub struct Subscription {
    topic: String,
    handler_id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 取消订阅，返回是否确实移除了处理器
    pub fn unsubscribe(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.remove_handler(&self.topic, self.handler_id),
            None => false,
        }
    }
}

struct Shared {
    transport: Arc<dyn PushTransport>,
    credential: Option<String>,
    config: ConnectionConfig,
    events: Arc<EventManager>,
    status: RwLock<ConnectionStatus>,
    handlers: RwLock<HashMap<String, Vec<(u64, MessageHandler)>>>,
    next_handler_id: AtomicU64,
    role_subscriptions: Mutex<BTreeMap<String, RoleSubscription>>,
    notifications: Mutex<NotificationQueue>,
    stopped: AtomicBool,
    gave_up: AtomicBool,
}

/// 长连接管理器
pub struct ConnectionManager {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        credential: Option<String>,
        config: ConnectionConfig,
        events: Arc<EventManager>,
    ) -> Self {
        let notifications = NotificationQueue::new(config.notification_capacity);
        Self {
            shared: Arc::new(Shared {
                transport,
                credential,
                config,
                events,
                status: RwLock::new(ConnectionStatus::Disconnected),
                handlers: RwLock::new(HashMap::new()),
                next_handler_id: AtomicU64::new(1),
                role_subscriptions: Mutex::new(BTreeMap::new()),
                notifications: Mutex::new(notifications),
                stopped: AtomicBool::new(false),
                gave_up: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// 建立连接（已在运行时忽略）
    pub fn start(&self) {
        self.launch(false);
    }

    fn launch(&self, close_previous: bool) {
        let mut task = self.task.lock();
        if task.as_ref().map(|handle| !handle.is_finished()).unwrap_or(false) {
            debug!("长连接已在运行");
            return;
        }
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.shared.gave_up.store(false, Ordering::SeqCst);

        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        *task = Some(tokio::spawn(run_connection(
            self.shared.clone(),
            token,
            close_previous,
        )));
        info!("🚀 长连接管理器已启动");
    }

    /// 同步拆除：停止重连循环并清空处理器
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.cancel.lock().cancel();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.shared.handlers.write().clear();
        self.shared
            .set_status(ConnectionStatus::Disconnected, Some("stopped".to_string()));

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = self.shared.transport.clone();
            runtime.spawn(async move { transport.close().await });
        }
        info!("长连接管理器已停止");
    }

    /// 停止并等待传输层关闭
    pub async fn shutdown(&self) {
        self.stop();
        self.shared.transport.close().await;
    }

    /// 手动重连（重置失败计数），先关闭旧连接再建立新连接
    pub fn reconnect(&self) {
        info!("🔄 手动重连");
        self.cancel.lock().cancel();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.launch(true);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// 自动重连是否已放弃
    pub fn has_given_up(&self) -> bool {
        self.shared.gave_up.load(Ordering::SeqCst)
    }

    /// 订阅主题（消息类型或 `data.type`），同一处理器不会重复注册
    pub fn subscribe(&self, topic: &str, handler: MessageHandler) -> Subscription {
        let mut handlers = self.shared.handlers.write();
        let entries = handlers.entry(topic.to_string()).or_default();

        let handler_id = match entries.iter().find(|(_, existing)| same_handler(existing, &handler)) {
            Some((id, _)) => {
                debug!("处理器已订阅 {}，忽略重复注册", topic);
                *id
            }
            None => {
                let id = self.shared.next_handler_id.fetch_add(1, Ordering::SeqCst);
                entries.push((id, handler));
                id
            }
        };

        Subscription {
            topic: topic.to_string(),
            handler_id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn on<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(handler))
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.shared
            .handlers
            .read()
            .get(topic)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// 按身份和角色订阅支付频道
    ///
    /// 同一 (consumer, topic) 只会向服务端发送一次订阅；断线重连后自动补发。
    pub async fn subscribe_consumer(&self, consumer_id: &str, role: ConsumerRole) -> Result<String> {
        if consumer_id.trim().is_empty() {
            return Err(CourseSyncError::Validation("consumer_id 不能为空".to_string()));
        }
        let topic = role.topic(consumer_id);
        let inserted = {
            let mut subscriptions = self.shared.role_subscriptions.lock();
            if subscriptions.contains_key(&topic) {
                false
            } else {
                subscriptions.insert(
                    topic.clone(),
                    RoleSubscription {
                        role,
                        consumer_id: consumer_id.to_string(),
                    },
                );
                true
            }
        };
        if !inserted {
            debug!("已订阅 {}，忽略", topic);
            return Ok(topic);
        }

        info!("订阅频道: {}", topic);
        if self.is_connected() {
            let message = OutboundMessage::subscribe(role.channel_kind(), consumer_id);
            if let Err(e) = self.shared.transport.send(message).await {
                warn!("⚠️ 发送订阅失败，将在重连后补发: {}", e);
            }
        }
        Ok(topic)
    }

    pub async fn unsubscribe_consumer(&self, consumer_id: &str, role: ConsumerRole) -> Result<bool> {
        let topic = role.topic(consumer_id);
        let removed = self.shared.role_subscriptions.lock().remove(&topic).is_some();
        if removed && self.is_connected() {
            let message = OutboundMessage::unsubscribe(role.channel_kind(), consumer_id);
            self.shared.transport.send(message).await?;
        }
        Ok(removed)
    }

    pub fn consumer_topics(&self) -> Vec<String> {
        self.shared.role_subscriptions.lock().keys().cloned().collect()
    }

    /// 通知快照（最新的在前）
    pub fn notifications(&self) -> Vec<Notification> {
        self.shared.notifications.lock().list()
    }

    pub fn unread_notifications(&self) -> Vec<Notification> {
        self.shared.notifications.lock().unread()
    }

    pub fn unread_count(&self) -> usize {
        self.shared.notifications.lock().unread_count()
    }

    pub fn mark_notification_read(&self, id: &str) -> bool {
        let changed = self.shared.notifications.lock().mark_read(id);
        if changed {
            self.shared.emit_notifications_changed();
        }
        changed
    }

    pub fn mark_all_notifications_read(&self) -> usize {
        let changed = self.shared.notifications.lock().mark_all_read();
        if changed > 0 {
            self.shared.emit_notifications_changed();
        }
        changed
    }

    pub fn clear_notifications(&self) {
        self.shared.notifications.lock().clear();
        self.shared.emit_notifications_changed();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.cancel.lock().cancel();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.shared.handlers.write().clear();
    }
}

#[async_trait]
impl LifecycleHook for ConnectionManager {
    async fn on_background(&self) -> Result<()> {
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        if self.has_given_up() {
            info!("回到前台，重新尝试连接");
            self.reconnect();
        }
        Ok(())
    }
}

fn same_handler(a: &MessageHandler, b: &MessageHandler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl Shared {
    fn set_status(&self, new_status: ConnectionStatus, reason: Option<String>) {
        let old_status = std::mem::replace(&mut *self.status.write(), new_status);
        if old_status == new_status {
            return;
        }
        info!("连接状态: {:?} -> {:?}", old_status, new_status);
        self.events.emit(event_builders::connection_status_changed(
            old_status, new_status, reason,
        ));
    }

    fn remove_handler(&self, topic: &str, handler_id: u64) -> bool {
        let mut handlers = self.handlers.write();
        let Some(entries) = handlers.get_mut(topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != handler_id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            handlers.remove(topic);
        }
        removed
    }

    fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.handlers
            .read()
            .get(topic)
            .map(|entries| entries.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    fn emit_notifications_changed(&self) {
        let (total, unread) = {
            let queue = self.notifications.lock();
            (queue.len(), queue.unread_count())
        };
        self.events
            .emit(event_builders::notifications_changed(total, unread));
    }

    fn dispatch(&self, message: &InboundMessage) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let data_type = message.data_type();
        let mut targets = self.handlers_for(&message.event_type);
        if let Some(data_type) = data_type.filter(|t| *t != message.event_type) {
            targets.extend(self.handlers_for(data_type));
        }
        for handler in targets {
            handler(message);
        }

        let kind = data_type.unwrap_or(&message.event_type);
        if !self.config.notification_event_types.iter().any(|t| t == kind) {
            return;
        }
        let notification = Notification::from_event(kind, &message.data);
        if let Some(evicted) = self.notifications.lock().push(notification.clone()) {
            debug!("通知队列已满，淘汰最旧通知: {}", evicted.id);
        }
        self.events.emit(SyncEvent::NotificationReceived(notification));
        self.emit_notifications_changed();
    }

    async fn replay_subscriptions(&self) {
        let messages: Vec<OutboundMessage> = self
            .role_subscriptions
            .lock()
            .values()
            .map(|s| OutboundMessage::subscribe(s.role.channel_kind(), &s.consumer_id))
            .collect();
        if messages.is_empty() {
            return;
        }
        debug!("补发 {} 个频道订阅", messages.len());
        for message in messages {
            if let Err(e) = self.transport.send(message).await {
                warn!("⚠️ 补发订阅失败: {}", e);
            }
        }
    }

    /// 读取传输事件直到断开
    async fn pump(&self, mut receiver: mpsc::Receiver<TransportEvent>) -> DisconnectReason {
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::Message(message) => self.dispatch(&message),
                TransportEvent::Ping => {
                    if let Err(e) = self.transport.send(OutboundMessage::pong()).await {
                        warn!("⚠️ 回复心跳失败: {}", e);
                    }
                }
                TransportEvent::Disconnected(reason) => return reason,
            }
        }
        DisconnectReason::ServerClosed
    }
}

/// 连接 + 重连循环
///
/// `failures` 统计连续连接失败次数（决定何时放弃），`reconnect_attempt` 统计本轮已安排的重连次数（决定退避间隔），
/// 两者在连接成功后都归零。
async fn run_connection(shared: Arc<Shared>, token: CancellationToken, close_previous: bool) {
    let policy = shared.config.reconnect_policy();
    let max_attempts = shared.config.max_reconnect_attempts.max(1);
    let mut failures: u32 = 0;
    let mut reconnect_attempt: u32 = 0;

    if close_previous {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = shared.transport.close() => {}
        }
    }
    shared.set_status(ConnectionStatus::Connecting, None);

    loop {
        let connected = tokio::select! {
            _ = token.cancelled() => return,
            result = shared.transport.connect(shared.credential.as_deref()) => result,
        };

        match connected {
            Ok(receiver) => {
                failures = 0;
                reconnect_attempt = 0;
                shared.gave_up.store(false, Ordering::SeqCst);
                info!("✅ 长连接已建立");
                shared.set_status(ConnectionStatus::Connected, None);
                shared.replay_subscriptions().await;

                let reason = tokio::select! {
                    _ = token.cancelled() => return,
                    reason = shared.pump(receiver) => reason,
                };
                if !reason.should_reconnect() {
                    shared.set_status(ConnectionStatus::Disconnected, Some(reason.to_string()));
                    return;
                }
                warn!("⚠️ 长连接断开: {}，准备重连", reason);
                shared.set_status(ConnectionStatus::Reconnecting, Some(reason.to_string()));
            }
            Err(e) => {
                failures += 1;
                warn!("⚠️ 连接失败 ({}/{}): {}", failures, max_attempts, e);
                if failures >= max_attempts {
                    error!("❌ 连续 {} 次连接失败，停止自动重连", failures);
                    shared.gave_up.store(true, Ordering::SeqCst);
                    shared.set_status(ConnectionStatus::Disconnected, Some(e.to_string()));
                    shared
                        .events
                        .emit(event_builders::max_reconnect_attempts_reached(failures));
                    return;
                }
                shared.set_status(ConnectionStatus::Reconnecting, Some(e.to_string()));
            }
        }

        reconnect_attempt += 1;
        let delay = policy.delay_for_attempt(reconnect_attempt);
        debug!("第 {} 次重连，{}ms 后开始", reconnect_attempt, delay.as_millis());
        shared.events.emit(event_builders::reconnect_scheduled(
            reconnect_attempt,
            delay.as_millis() as u64,
        ));
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::test_helpers::MockTransport;
    use crate::connection::NotificationType;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn manager_with(config: ConnectionConfig) -> (ConnectionManager, Arc<MockTransport>, Arc<EventManager>) {
        let transport = Arc::new(MockTransport::default());
        let events = Arc::new(EventManager::default());
        let manager = ConnectionManager::new(
            transport.clone(),
            Some("session-abc".to_string()),
            config,
            events.clone(),
        );
        (manager, transport, events)
    }

    fn manager() -> (ConnectionManager, Arc<MockTransport>, Arc<EventManager>) {
        manager_with(ConnectionConfig::default())
    }

    fn counter(events: &EventManager, event_type: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = count.clone();
        events.add_listener(event_type, move |_| {
            clone.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_ceiling_stops_after_five_failures() {
        let (manager, transport, events) = manager();
        let exhausted = counter(&events, "max_reconnect_attempts_reached");
        transport.fail_next(usize::MAX);

        manager.start();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.connect_attempts(), 5);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(manager.has_given_up());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.connect_attempts(), 5);

        transport.fail_next(0);
        manager.reconnect();
        settle().await;
        assert_eq!(transport.connect_attempts(), 6);
        assert!(manager.is_connected());
        assert!(!manager.has_given_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_failures_uses_credential() {
        let (manager, transport, events) = manager();
        let scheduled = counter(&events, "reconnect_scheduled");
        transport.fail_next(2);

        manager.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(manager.is_connected());
        assert_eq!(transport.connect_attempts(), 3);
        assert_eq!(scheduled.load(Ordering::SeqCst), 2);
        assert!(transport
            .credentials()
            .iter()
            .all(|c| c.as_deref() == Some("session-abc")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_delivery_order_and_notifications() {
        let (manager, transport, events) = manager();
        let received = counter(&events, "notification_received");
        let order = Arc::new(Mutex::new(Vec::new()));
        let raw_order = order.clone();
        manager.on("payment_update", move |_| raw_order.lock().push("raw"));
        let typed_order = order.clone();
        manager.on("payment_success", move |_| typed_order.lock().push("typed"));

        manager.start();
        settle().await;
        transport
            .push(TransportEvent::Message(InboundMessage::new(
                "payment_update",
                json!({"type": "payment_success", "amount": 49, "timestamp": 1_700_000_000_000i64}),
            )))
            .await;
        transport
            .push(TransportEvent::Message(InboundMessage::new(
                "progress_update",
                json!({"type": "progress_saved", "itemId": "lec-1"}),
            )))
            .await;
        settle().await;

        assert_eq!(*order.lock(), vec!["raw", "typed"]);
        assert_eq!(received.load(Ordering::SeqCst), 1);
        let notifications = manager.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationType::Success);
        assert_eq!(manager.unread_count(), 1);

        assert!(manager.mark_notification_read(&notifications[0].id));
        assert!(manager.unread_notifications().is_empty());
        manager.clear_notifications();
        assert!(manager.notifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_queue_respects_configured_capacity() {
        let config = ConnectionConfig {
            notification_capacity: 3,
            ..ConnectionConfig::default()
        };
        let (manager, transport, _events) = manager_with(config);
        manager.start();
        settle().await;

        for amount in 0..4 {
            transport
                .push(TransportEvent::Message(InboundMessage::new(
                    "payment_update",
                    json!({"type": "payment_refunded", "amount": amount}),
                )))
                .await;
        }
        settle().await;

        let notifications = manager.notifications();
        assert_eq!(notifications.len(), 3);
        assert_eq!(notifications[0].data["amount"], 3);
        assert_eq!(notifications[2].data["amount"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_handler_registered_once() {
        let (manager, transport, _events) = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let handler: MessageHandler = Arc::new(move |_: &InboundMessage| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let first = manager.subscribe("enrollment_created", handler.clone());
        let _second = manager.subscribe("enrollment_created", handler.clone());
        assert_eq!(manager.handler_count("enrollment_created"), 1);

        manager.start();
        settle().await;
        transport
            .push(TransportEvent::Message(InboundMessage::new("enrollment_created", json!({}))))
            .await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(first.unsubscribe());
        assert!(!first.unsubscribe());
        transport
            .push(TransportEvent::Message(InboundMessage::new("enrollment_created", json!({}))))
            .await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_subscription_is_idempotent_and_replayed() {
        let (manager, transport, _events) = manager();
        manager.start();
        settle().await;

        let topic = manager
            .subscribe_consumer("t-1", ConsumerRole::Teacher)
            .await
            .unwrap();
        assert_eq!(topic, "teacher-payments:t-1");
        manager
            .subscribe_consumer("t-1", ConsumerRole::Teacher)
            .await
            .unwrap();
        assert_eq!(transport.sent_events("subscribe_teacher_payments"), 1);

        transport.drop_connection();
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Reconnecting);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.is_connected());
        assert_eq!(transport.sent_events("subscribe_teacher_payments"), 2);

        assert!(manager
            .unsubscribe_consumer("t-1", ConsumerRole::Teacher)
            .await
            .unwrap());
        assert_eq!(transport.sent_events("unsubscribe_teacher_payments"), 1);
        assert!(manager.consumer_topics().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_answered_and_heartbeat_timeout_reconnects() {
        let (manager, transport, _events) = manager();
        manager.start();
        settle().await;

        transport.push(TransportEvent::Ping).await;
        settle().await;
        assert_eq!(transport.sent_events("pong"), 1);

        transport
            .push(TransportEvent::Disconnected(DisconnectReason::HeartbeatTimeout))
            .await;
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Reconnecting);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.is_connected());
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_detaches_handlers_and_stops_loop() {
        let (manager, transport, _events) = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        manager.on("payment_update", move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        manager.start();
        settle().await;

        manager.stop();
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.handler_count("payment_update"), 0);

        transport
            .push(TransportEvent::Message(InboundMessage::new("payment_update", json!({}))))
            .await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_hook_retries_after_giving_up() {
        let (manager, transport, _events) = manager();
        transport.fail_next(5);
        manager.start();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(manager.has_given_up());

        manager.on_foreground().await.unwrap();
        settle().await;
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_delays_double_after_a_dropped_connection() {
        let (manager, transport, events) = manager();
        let scheduled = Arc::new(Mutex::new(Vec::new()));
        let scheduled_clone = scheduled.clone();
        events.add_listener("reconnect_scheduled", move |event| {
            if let SyncEvent::ReconnectScheduled { attempt, delay_ms, .. } = event {
                scheduled_clone.lock().push((*attempt, *delay_ms));
            }
        });
        manager.start();
        settle().await;

        transport.fail_next(2);
        transport.drop_connection();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(manager.is_connected());
        assert_eq!(transport.connect_attempts(), 4);

        let scheduled = scheduled.lock().clone();
        assert_eq!(scheduled.len(), 3);
        for ((attempt, delay_ms), (expected_attempt, base_ms)) in
            scheduled.into_iter().zip([(1, 1_000u64), (2, 2_000), (3, 4_000)])
        {
            assert_eq!(attempt, expected_attempt);
            assert!(
                delay_ms >= base_ms && delay_ms <= base_ms + base_ms / 10,
                "attempt {} waited {}ms",
                attempt,
                delay_ms
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_closes_previous_connection_first() {
        let (manager, transport, _events) = manager();
        manager.start();
        settle().await;
        assert!(manager.is_connected());

        manager.reconnect();
        settle().await;
        assert!(manager.is_connected());
        assert_eq!(transport.call_log(), vec!["connect", "close", "connect"]);
    }
}
