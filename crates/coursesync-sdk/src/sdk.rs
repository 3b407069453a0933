//! SDK 入口
//!
//! `CourseSyncClient` 是显式构造的组合根，按层初始化：
//! 1. 存储层 → 2. 网络层 → 3. 事件层 → 4. 进度存储 → 5. 长连接 → 6. 生命周期

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, InboundMessage, PushTransport, Subscription};
use crate::error::{CourseSyncError, Result};
use crate::events::EventManager;
use crate::lifecycle::LifecycleManager;
use crate::network::{NetworkMonitor, NetworkStatus, NetworkStatusListener};
use crate::progress::{HttpProgressApi, ProgressApi, ProgressPayload, ProgressStore};
use crate::storage::KvStore;

/// 服务端推送的进度确认事件类型
pub const PROGRESS_UPDATE_EVENT: &str = "progress_update";

/// 由平台层提供的组件，未提供时使用默认实现
#[derive(Default)]
pub struct PlatformHooks {
    /// 网络状态监听；未提供时默认在线，可通过 `set_network_status` 手动切换
    pub network_listener: Option<Arc<dyn NetworkStatusListener>>,
    /// 推送通道；未提供时不建立长连接
    pub push_transport: Option<Arc<dyn PushTransport>>,
    /// 进度接口；未提供时使用基于 reqwest 的 HTTP 实现
    pub progress_api: Option<Arc<dyn ProgressApi>>,
}

/// 同步引擎客户端
pub struct CourseSyncClient {
    config: SyncConfig,
    kv: KvStore,
    events: Arc<EventManager>,
    network: Arc<NetworkMonitor>,
    progress: Arc<ProgressStore>,
    connection: Option<Arc<ConnectionManager>>,
    lifecycle: LifecycleManager,
    progress_subscription: Option<Subscription>,
    shutting_down: AtomicBool,
}

impl CourseSyncClient {
    /// 初始化并启动所有组件
    pub async fn initialize(config: SyncConfig, hooks: PlatformHooks) -> Result<Arc<Self>> {
        info!("正在初始化 CourseSync SDK v{}...", crate::version::SDK_VERSION);
        config.validate()?;

        // === 第1层：本地存储 ===
        let kv = KvStore::open(&config.data_dir, &config.namespace).await?;

        // === 第2层：网络监控 ===
        let network = Arc::new(match hooks.network_listener {
            Some(listener) => NetworkMonitor::new(listener),
            None => NetworkMonitor::manual(NetworkStatus::Online),
        });
        network.start().await?;

        // === 第3层：事件管理器 ===
        let events = Arc::new(EventManager::new(config.event_buffer_size));

        // === 第4层：进度存储 ===
        let api: Arc<dyn ProgressApi> = match hooks.progress_api {
            Some(api) => api,
            None => Arc::new(HttpProgressApi::new(
                &config.http,
                config.api_base_url.clone(),
                config.session_token.clone(),
            )?),
        };
        let progress = Arc::new(ProgressStore::new(
            kv.clone(),
            api,
            network.clone(),
            events.clone(),
            config.retry.clone(),
            config.progress.clone(),
        ));
        progress.start();
        info!("进度存储初始化完成");

        // === 第5层：长连接 ===
        let mut progress_subscription = None;
        let connection = match hooks.push_transport {
            Some(transport) => {
                let manager = Arc::new(ConnectionManager::new(
                    transport,
                    config.session_token.clone(),
                    config.connection.clone(),
                    events.clone(),
                ));
                progress_subscription = Some(subscribe_progress_confirmations(
                    &manager,
                    Arc::downgrade(&progress),
                ));
                manager.start();
                info!("长连接管理器初始化完成");
                Some(manager)
            }
            None => {
                debug!("未提供推送通道，跳过长连接");
                None
            }
        };

        // === 第6层：生命周期 ===
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(progress.clone());
        if let Some(manager) = &connection {
            lifecycle.register_hook(manager.clone());
        }

        info!("✅ CourseSync SDK 初始化完成");
        Ok(Arc::new(Self {
            config,
            kv,
            events,
            network,
            progress,
            connection,
            lifecycle,
            progress_subscription,
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn progress(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    pub fn connection(&self) -> Option<&Arc<ConnectionManager>> {
        self.connection.as_ref()
    }

    /// 手动设置网络状态（没有平台监听器时使用）
    pub fn set_network_status(&self, status: NetworkStatus) {
        self.network.set_status(status);
    }

    /// App 切换到后台
    pub async fn on_background(&self) -> Result<()> {
        self.ensure_running()?;
        self.lifecycle.notify_background().await
    }

    /// App 切换到前台
    pub async fn on_foreground(&self) -> Result<()> {
        self.ensure_running()?;
        self.lifecycle.notify_foreground().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// 关闭 SDK：先上报待同步进度，再断开长连接、停止网络监控
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭 CourseSync SDK...");

        self.progress.shutdown().await;
        if let Some(subscription) = &self.progress_subscription {
            subscription.unsubscribe();
        }
        if let Some(manager) = &self.connection {
            manager.shutdown().await;
        }
        self.network.stop().await;
        self.kv.flush()?;

        info!("CourseSync SDK 关闭完成");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(CourseSyncError::ShuttingDown("client".to_string()));
        }
        Ok(())
    }
}

/// 服务端推送的进度确认交给进度存储（本地无待同步修改时采用）
fn subscribe_progress_confirmations(
    manager: &ConnectionManager,
    progress: Weak<ProgressStore>,
) -> Subscription {
    manager.on(PROGRESS_UPDATE_EVENT, move |message: &InboundMessage| {
        let Some(progress) = progress.upgrade() else {
            return;
        };
        let Some(item_id) = message.data.get("itemId").and_then(|v| v.as_str()) else {
            warn!("⚠️ 进度推送缺少 itemId，忽略");
            return;
        };
        let payload: ProgressPayload = match serde_json::from_value(message.data.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("⚠️ 无法解析进度推送: item={}, error={}", item_id, e);
                return;
            }
        };
        if let Err(e) = progress.apply_server_record(payload.into_record(item_id)) {
            warn!("⚠️ 应用服务端进度失败: item={}, error={}", item_id, e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::test_helpers::MockTransport;
    use crate::connection::TransportEvent;
    use crate::progress::api::test_helpers::MockProgressApi;
    use crate::progress::{ProgressRecord, SyncState};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestClient {
        client: Arc<CourseSyncClient>,
        api: Arc<MockProgressApi>,
        transport: Arc<MockTransport>,
        _dir: TempDir,
    }

    async fn client() -> TestClient {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::builder()
            .data_dir(dir.path())
            .namespace("student-1")
            .session_token("session-abc")
            .try_build()
            .unwrap();
        let api = Arc::new(MockProgressApi::default());
        let transport = Arc::new(MockTransport::default());
        let hooks = PlatformHooks {
            network_listener: None,
            push_transport: Some(transport.clone()),
            progress_api: Some(api.clone()),
        };
        let client = CourseSyncClient::initialize(config, hooks).await.unwrap();
        TestClient {
            client,
            api,
            transport,
            _dir: dir,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_scenario_end_to_end() {
        let t = client().await;
        settle().await;
        assert!(t.client.connection().unwrap().is_connected());

        let record = t.client.progress().update_progress("lec-1", 550.0, 600.0).unwrap();
        assert_eq!(record.completion_percent, 91.67);
        settle().await;

        let calls = t.api.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.is_completed);
        assert_eq!(
            t.client.progress().status("lec-1").unwrap().state,
            SyncState::Synced
        );

        t.client.shutdown().await.unwrap();
        assert!(t.client.on_background().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_progress_is_applied() {
        let t = client().await;
        settle().await;

        let mut remote = ProgressRecord::new("lec-2");
        remote.apply_position(120.0, 600.0, 90.0, 30.0).unwrap();
        let mut data = serde_json::to_value(remote.to_payload()).unwrap();
        data["itemId"] = json!("lec-2");
        t.transport
            .push(TransportEvent::Message(InboundMessage::new(PROGRESS_UPDATE_EVENT, data)))
            .await;
        settle().await;

        assert_eq!(
            t.client.progress().load("lec-2").unwrap().position_seconds,
            120.0
        );
        t.client.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_flushes_and_offline_defers() {
        let t = client().await;
        settle().await;

        t.client.set_network_status(NetworkStatus::Offline);
        t.client.progress().update_progress("lec-3", 30.0, 600.0).unwrap();
        t.client.on_background().await.unwrap();
        assert_eq!(t.api.call_count(), 0);

        t.client.set_network_status(NetworkStatus::Online);
        settle().await;
        assert_eq!(t.api.call_count(), 1);

        t.client.shutdown().await.unwrap();
        assert!(t.client.is_shutting_down());
    }
}
