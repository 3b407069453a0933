//! 长连接模块
//!
//! 一条长连接、断线指数退避重连、按主题订阅、有界通知队列。

pub mod manager;
pub mod notification;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use manager::{ConnectionManager, ConsumerRole, MessageHandler, Subscription};
pub use notification::{Notification, NotificationQueue, NotificationType};
pub use transport::{DisconnectReason, InboundMessage, OutboundMessage, PushTransport, TransportEvent};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// 断线后等待/正在重连
    Reconnecting,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}
