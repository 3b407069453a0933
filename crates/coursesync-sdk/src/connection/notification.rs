//! 通知队列
//!
//! 由长连接推送事件转换而来，保存在内存中的有界队列（默认 50 条，超出时淘汰最旧的一条）。
//! 只允许已读/未读状态变化，不会重排。

use std::collections::VecDeque;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Success,
    Error,
    Warning,
    Info,
}

/// 单条通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    #[serde(default)]
    pub data: Value,
}

impl Notification {
    pub fn new(
        kind: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            read: false,
            data,
        }
    }

    /// 把推送事件转换为通知
    ///
    /// 标题由事件类型决定；`data.message` 存在时作为正文，`data.timestamp` 存在时作为通知时间。
    pub fn from_event(event_type: &str, data: &Value) -> Self {
        let (kind, title, default_message) = match event_type {
            "payment_success" => (
                NotificationType::Success,
                "Payment successful",
                "Your payment was processed.",
            ),
            "payment_failed" => (
                NotificationType::Error,
                "Payment failed",
                "A payment could not be completed.",
            ),
            "payment_refunded" => (
                NotificationType::Info,
                "Payment refunded",
                "A payment was refunded.",
            ),
            "payout_processed" => (
                NotificationType::Success,
                "Payout processed",
                "A payout was sent to your account.",
            ),
            "enrollment_created" => (
                NotificationType::Info,
                "New enrollment",
                "A student enrolled in your course.",
            ),
            "course_completed" => (
                NotificationType::Success,
                "Course completed",
                "A course was completed.",
            ),
            _ => (NotificationType::Info, "Update", "You have a new update."),
        };

        let message = data
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(default_message);
        let mut notification = Self::new(kind, title, message, data.clone());
        if let Some(timestamp) = data.get("timestamp").and_then(parse_timestamp) {
            notification.timestamp = timestamp;
        }
        notification
    }
}

/// 解析推送里的时间戳：RFC 3339 字符串或毫秒数
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// 有界通知队列，最新的在前
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    capacity: usize,
    items: VecDeque<Notification>,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// 入队，超出容量时返回被淘汰的最旧通知
    pub fn push(&mut self, notification: Notification) -> Option<Notification> {
        self.items.push_front(notification);
        if self.items.len() > self.capacity {
            self.items.pop_back()
        } else {
            None
        }
    }

    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(notification) if !notification.read => {
                notification.read = true;
                true
            }
            _ => false,
        }
    }

    /// 全部标记已读，返回本次变化的条数
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for notification in self.items.iter_mut().filter(|n| !n.read) {
            notification.read = true;
            changed += 1;
        }
        changed
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// 快照（最新的在前）
    pub fn list(&self) -> Vec<Notification> {
        self.items.iter().cloned().collect()
    }

    pub fn unread(&self) -> Vec<Notification> {
        self.items.iter().filter(|n| !n.read).cloned().collect()
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
