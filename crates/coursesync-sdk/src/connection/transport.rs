//! 推送通道抽象
//!
//! 具体传输（WebSocket、平台原生长连接等）由平台层实现 `PushTransport`；
//! 心跳超时由传输层自行判定，并以 `Disconnected(HeartbeatTimeout)` 上报。

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::Result;

/// 服务端推送：`{type, data: {..., timestamp}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundMessage {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// 细分类型（`data.type`）
    pub fn data_type(&self) -> Option<&str> {
        self.data.get("type").and_then(Value::as_str)
    }
}

/// 客户端发出的消息：`{event, payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub event: String,
    pub payload: Value,
}

impl OutboundMessage {
    pub fn subscribe(kind: &str, id: &str) -> Self {
        Self {
            event: format!("subscribe_{}", kind),
            payload: json!({ "id": id }),
        }
    }

    pub fn unsubscribe(kind: &str, id: &str) -> Self {
        Self {
            event: format!("unsubscribe_{}", kind),
            payload: json!({ "id": id }),
        }
    }

    pub fn pong() -> Self {
        Self {
            event: "pong".to_string(),
            payload: json!({}),
        }
    }
}

/// 断开原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// 客户端主动关闭，不重连
    ClientClosed,
    /// 服务端关闭
    ServerClosed,
    /// 传输错误
    TransportError(String),
    /// 心跳超时
    HeartbeatTimeout,
}

impl DisconnectReason {
    /// 是否需要自动重连
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, DisconnectReason::ClientClosed)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientClosed => write!(f, "client closed"),
            DisconnectReason::ServerClosed => write!(f, "server closed"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {}", e),
            DisconnectReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
        }
    }
}

/// 传输层事件
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// 服务端心跳，需要回复 pong
    Ping,
    Disconnected(DisconnectReason),
}

/// 推送通道
///
/// `connect` 成功即视为已连接，返回的接收端关闭等同于服务端断开。
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, credential: Option<&str>) -> Result<mpsc::Receiver<TransportEvent>>;

    async fn send(&self, message: OutboundMessage) -> Result<()>;

    async fn close(&self);
}
