//! CourseSync SDK - 学习平台客户端状态同步引擎
//!
//! 在不稳定、时断时续的网络上保持学习进度正确且不丢失，同时不阻塞用户：
//! - 📚 进度存储：本地优先写入，防抖上报，完成阈值立即上报，离线排队
//! - 🔁 重试执行器：指数退避 + 抖动，可插拔重试判定，可取消
//! - 🔗 长连接管理：断线重连、按角色订阅、有界通知队列
//! - 📡 网络状态监控和生命周期钩子
//! - ⚙️ 事件系统：统一的事件广播和监听
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use coursesync_sdk::{CourseSyncClient, PlatformHooks, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .namespace("student-42")
//!         .api_base_url("https://learn.example.com/api")
//!         .session_token("session-token")
//!         .build();
//!
//!     let client = CourseSyncClient::initialize(config, PlatformHooks::default()).await?;
//!
//!     client.events().add_listener("progress_sync_state_changed", |event| {
//!         println!("同步状态变化: {:?}", event);
//!     });
//!
//!     // 本地立即落盘，10 秒无新进度后上报
//!     client.progress().update_progress("lec-1", 120.0, 600.0)?;
//!
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod network;
pub mod progress;
pub mod retry;
pub mod sdk;
pub mod storage;
pub mod version;

pub use config::{ConnectionConfig, HttpClientConfig, ProgressConfig, SyncConfig, SyncConfigBuilder};
pub use connection::{
    ConnectionManager, ConnectionStatus, ConsumerRole, DisconnectReason, InboundMessage,
    MessageHandler, Notification, NotificationQueue, NotificationType, OutboundMessage,
    PushTransport, Subscription, TransportEvent,
};
pub use error::{CourseSyncError, FailureKind, Result};
pub use events::{EventFilter, EventManager, EventStats, ListenerId, SyncEvent};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use progress::{
    HttpProgressApi, ItemStatus, ProgressApi, ProgressPayload, ProgressRecord, ProgressStats,
    ProgressStore, SyncState,
};
pub use retry::{RetryContext, RetryExecutor, RetryOptions, RetryPolicy, RetryPredicate};
pub use sdk::{CourseSyncClient, PlatformHooks};
pub use storage::{KvStats, KvStore};
pub use version::SDK_VERSION;
