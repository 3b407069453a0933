//! 进度存储
//!
//! 单个条目的状态机：`Synced → Pending → {Synced | Error | Offline}`。
//!
//! - 每次 `update_progress` 同步写入本地 KV（`progress:{item_id}`），并写入待同步标记
//!   （`progress-pending:{item_id}`），重启后仍可恢复
//! - 防抖定时器只负责等待，到期后另起任务执行上报，重新调度不会打断正在进行的上报
//! - 同一条目同时最多一个上报在途，期间的立即同步请求记为 follow-up，完成后再执行
//! - 冲突策略：本地优先，上报成功后服务端确认的记录作为参照
//! - 关闭时先等在途上报结束（以重试策略的最长耗时为上限），再补报剩余修改，最后才取消

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProgressConfig;
use crate::error::{CourseSyncError, FailureKind, Result};
use crate::events::{event_builders, EventManager, SyncEvent};
use crate::lifecycle::LifecycleHook;
use crate::network::NetworkMonitor;
use crate::progress::api::ProgressApi;
use crate::progress::model::{ProgressPayload, ProgressRecord};
use crate::progress::SyncState;
use crate::retry::{RetryExecutor, RetryOptions, RetryPolicy};
use crate::storage::{keys, KvStats, KvStore};

/// 单个条目的同步状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct ItemStatus {
    pub state: SyncState,
    /// 最近一次失败的提示文案
    pub last_error: Option<String>,
    /// 是否有尚未上报成功的本地修改
    pub has_pending_changes: bool,
    /// 是否正在上报
    pub syncing: bool,
}

/// 同步统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressStats {
    pub syncs_attempted: u64,
    pub syncs_succeeded: u64,
    pub syncs_failed: u64,
    pub syncs_skipped_offline: u64,
}

struct ItemEntry {
    record: ProgressRecord,
    acknowledged: Option<ProgressRecord>,
    state: SyncState,
    last_error: Option<String>,
    /// 本地记录是否已写入 KV
    persisted: bool,
    dirty: bool,
    in_flight: bool,
    follow_up: bool,
    debounce: Option<JoinHandle<()>>,
}

impl ItemEntry {
    fn fresh(item_id: &str) -> Self {
        Self {
            record: ProgressRecord::new(item_id),
            acknowledged: None,
            state: SyncState::Synced,
            last_error: None,
            persisted: false,
            dirty: false,
            in_flight: false,
            follow_up: false,
            debounce: None,
        }
    }

    /// 切换状态，状态或错误信息有变化时返回待发布的事件
    fn transition(&mut self, new_state: SyncState, error: Option<String>) -> Option<SyncEvent> {
        if self.state == new_state && self.last_error == error {
            return None;
        }
        let old_state = self.state;
        self.state = new_state;
        self.last_error = error.clone();
        if old_state != new_state {
            debug!(
                "进度同步状态: item={}, {} -> {}",
                self.record.item_id, old_state, new_state
            );
        }
        Some(event_builders::progress_sync_state_changed(
            &self.record.item_id,
            old_state,
            new_state,
            error,
        ))
    }

    fn cancel_debounce(&mut self) {
        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
    }
}

struct StoreInner {
    kv: KvStore,
    api: Arc<dyn ProgressApi>,
    executor: RetryExecutor,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    config: ProgressConfig,
    items: Mutex<HashMap<String, ItemEntry>>,
    stats: Mutex<ProgressStats>,
    closing: AtomicBool,
    shutdown: CancellationToken,
    network_task: Mutex<Option<JoinHandle<()>>>,
    /// 在途上报数量
    in_flight_count: watch::Sender<usize>,
}

/// 持有期间计入在途上报数量
struct InFlightSlot<'a>(&'a watch::Sender<usize>);

impl<'a> InFlightSlot<'a> {
    fn new(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// 学习进度存储
pub struct ProgressStore {
    inner: Arc<StoreInner>,
}

impl ProgressStore {
    pub fn new(
        kv: KvStore,
        api: Arc<dyn ProgressApi>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
        retry_policy: RetryPolicy,
        config: ProgressConfig,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                kv,
                api,
                executor: RetryExecutor::new(retry_policy),
                network,
                events,
                config,
                items: Mutex::new(HashMap::new()),
                stats: Mutex::new(ProgressStats::default()),
                closing: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                network_task: Mutex::new(None),
                in_flight_count: watch::channel(0).0,
            }),
        }
    }

    /// 开始监听网络状态，网络恢复时自动上报待同步条目；在线时立即恢复上次遗留的待同步条目
    pub fn start(&self) {
        let mut receiver = self.inner.network.subscribe();
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if event.new_status.is_online() {
                            info!("🌐 网络已恢复，开始上报待同步进度");
                            if let Err(e) = inner.resume_pending().await {
                                warn!("⚠️ 网络恢复后上报失败: {}", e);
                            }
                        } else {
                            inner.mark_offline();
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("网络状态事件积压，跳过 {} 条", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.inner.network_task.lock().replace(handle) {
            previous.abort();
        }

        if self.inner.network.is_online() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.resume_pending().await {
                    warn!("⚠️ 恢复待同步进度失败: {}", e);
                }
            });
        }
        info!("✅ 进度存储已启动");
    }

    /// 上报播放位置
    ///
    /// 本地写入在返回前完成；上报由防抖定时器触发，首次跨过完成阈值时立即上报。
    pub fn update_progress(&self, item_id: &str, position: f64, duration: f64) -> Result<ProgressRecord> {
        self.inner.ensure_open()?;
        let config = &self.inner.config;

        let (record, crossed_threshold, event) = {
            let mut items = self.inner.items.lock();
            let entry = self.inner.entry_mut(&mut items, item_id)?;
            let mut next = entry.record.clone();
            let change = next.apply_position(
                position,
                duration,
                config.completion_threshold,
                config.max_watch_delta_secs,
            )?;
            self.inner.persist(&next)?;
            entry.record = next.clone();
            entry.persisted = true;
            entry.dirty = true;
            let event = if entry.in_flight {
                None
            } else {
                entry.transition(SyncState::Pending, None)
            };
            (next, change.crossed_threshold, event)
        };
        self.inner.emit_all(event);

        if crossed_threshold {
            info!(
                "🎓 条目已完成: item={}, completion={}%，立即上报",
                item_id, record.completion_percent
            );
            self.inner.sync_now_detached(item_id);
        } else {
            self.inner.schedule_debounced(item_id);
        }
        Ok(record)
    }

    /// 强制标记完成并立即上报
    ///
    /// 上报失败不会回滚本地完成状态，失败原因通过 `status()` 查看。
    pub async fn mark_completed(&self, item_id: &str) -> Result<ProgressRecord> {
        self.inner.ensure_open()?;
        let (record, event) = {
            let mut items = self.inner.items.lock();
            let entry = self.inner.entry_mut(&mut items, item_id)?;
            let mut next = entry.record.clone();
            next.mark_completed();
            self.inner.persist(&next)?;
            entry.record = next.clone();
            entry.persisted = true;
            entry.dirty = true;
            entry.cancel_debounce();
            let event = if entry.in_flight {
                None
            } else {
                entry.transition(SyncState::Pending, None)
            };
            (next, event)
        };
        self.inner.emit_all(event);

        info!("🎓 手动标记完成: item={}", item_id);
        if let Err(e) = self.inner.sync_now(item_id).await {
            warn!("⚠️ 完成状态上报失败，已保留在本地: item={}, error={}", item_id, e);
        }
        Ok(record)
    }

    /// 显式保存（幂等）：没有本地修改时不会发起请求
    pub async fn save_progress(&self, item_id: &str) -> Result<()> {
        {
            let mut items = self.inner.items.lock();
            self.inner.entry_mut(&mut items, item_id)?;
        }
        self.inner.sync_now(item_id).await
    }

    /// 上报所有有本地修改的条目
    pub async fn save_all(&self) -> Result<()> {
        self.inner.save_all().await
    }

    /// 从 KV 恢复上次遗留的待同步条目并上报
    pub async fn resume_pending(&self) -> Result<()> {
        self.inner.resume_pending().await
    }

    /// 读取进度：内存 → 本地缓存 → 新记录（本地数据损坏视为不存在）
    pub fn load(&self, item_id: &str) -> Result<ProgressRecord> {
        let mut items = self.inner.items.lock();
        let entry = self.inner.entry_mut(&mut items, item_id)?;
        Ok(entry.record.clone())
    }

    /// 拉取服务端副本；服务端更新且本地没有待同步修改时采用服务端记录
    pub async fn hydrate_from_server(&self, item_id: &str) -> Result<ProgressRecord> {
        if !self.inner.network.is_online() {
            debug!("离线，跳过拉取服务端进度: item={}", item_id);
            return self.load(item_id);
        }

        let api = self.inner.api.clone();
        let id = item_id.to_string();
        let remote = self
            .inner
            .executor
            .execute(
                move |_token| {
                    let api = api.clone();
                    let id = id.clone();
                    async move { api.fetch_progress(&id).await }
                },
                self.inner.retry_options(item_id),
            )
            .await?;

        if let Some(payload) = remote {
            self.apply_server_record(payload.into_record(item_id))?;
        }
        self.load(item_id)
    }

    /// 服务端确认路径（推送或拉取）
    ///
    /// 本地有待同步修改或正在上报时保留本地记录；否则服务端记录较新时采用。返回是否采用。
    pub fn apply_server_record(&self, record: ProgressRecord) -> Result<bool> {
        let item_id = record.item_id.clone();
        let (adopted, event) = {
            let mut items = self.inner.items.lock();
            let entry = self.inner.entry_mut(&mut items, &item_id)?;
            if entry.dirty || entry.in_flight {
                debug!("本地有待同步修改，忽略服务端记录: item={}", item_id);
                return Ok(false);
            }
            if entry.persisted && record.last_updated <= entry.record.last_updated {
                if record.last_updated == entry.record.last_updated {
                    entry.acknowledged = Some(record);
                }
                return Ok(false);
            }
            self.inner.kv.set(keys::progress(&item_id), &record)?;
            entry.record = record.clone();
            entry.acknowledged = Some(record);
            entry.persisted = true;
            (true, entry.transition(SyncState::Synced, None))
        };
        self.inner.emit_all(event);
        info!("采用服务端进度: item={}", item_id);
        Ok(adopted)
    }

    /// 删除条目的本地进度（内存 + KV）
    pub fn reset(&self, item_id: &str) -> Result<bool> {
        let removed = {
            let mut items = self.inner.items.lock();
            let removed = items.remove(item_id);
            if let Some(mut entry) = removed {
                entry.cancel_debounce();
                true
            } else {
                false
            }
        };
        let deleted = self.inner.kv.delete(keys::progress(item_id))?;
        self.inner.kv.delete(keys::progress_pending(item_id))?;
        info!("进度已重置: item={}", item_id);
        Ok(removed || deleted)
    }

    /// 本地保存的所有进度记录
    pub fn records(&self) -> Result<Vec<ProgressRecord>> {
        let stored: Vec<(String, ProgressRecord)> = self.inner.kv.scan_prefix(keys::PROGRESS)?;
        Ok(stored.into_iter().map(|(_, record)| record).collect())
    }

    pub fn status(&self, item_id: &str) -> Option<ItemStatus> {
        self.inner.items.lock().get(item_id).map(|entry| ItemStatus {
            state: entry.state,
            last_error: entry.last_error.clone(),
            has_pending_changes: entry.dirty,
            syncing: entry.in_flight,
        })
    }

    /// 最近一次服务端确认的记录
    pub fn acknowledged(&self, item_id: &str) -> Option<ProgressRecord> {
        self.inner
            .items
            .lock()
            .get(item_id)
            .and_then(|entry| entry.acknowledged.clone())
    }

    /// 是否有上报正处于重试等待中
    pub fn is_retrying(&self) -> bool {
        self.inner.executor.is_retrying()
    }

    pub fn stats(&self) -> ProgressStats {
        *self.inner.stats.lock()
    }

    pub fn storage_stats(&self) -> Result<KvStats> {
        self.inner.kv.stats()
    }

    /// 关闭：取消防抖定时器；在线时等在途上报结束，再把剩余的待同步条目上报一次，然后停止所有后台任务
    pub async fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🔄 进度存储关闭中...");
        self.inner.cancel_all_debounces();

        if self.inner.network.is_online() {
            self.inner.drain_in_flight().await;
            if let Err(e) = self.inner.save_all().await {
                warn!("⚠️ 关闭前上报失败，待同步标记已保留: {}", e);
            }
        }

        self.inner.shutdown.cancel();
        self.inner.executor.shutdown();
        if let Some(handle) = self.inner.network_task.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.inner.kv.flush() {
            error!("❌ 关闭时落盘失败: {}", e);
        }
        info!("✅ 进度存储已关闭");
    }
}

impl Drop for ProgressStore {
    fn drop(&mut self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        self.inner.executor.shutdown();
        self.inner.cancel_all_debounces();
        if let Some(handle) = self.inner.network_task.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl LifecycleHook for ProgressStore {
    async fn on_background(&self) -> Result<()> {
        self.inner.kv.flush()?;
        if !self.inner.network.is_online() {
            return Ok(());
        }
        self.inner.save_all().await
    }

    async fn on_foreground(&self) -> Result<()> {
        if !self.inner.network.is_online() {
            return Ok(());
        }
        self.inner.resume_pending().await
    }
}

impl StoreInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(CourseSyncError::ShuttingDown("progress store".to_string()));
        }
        Ok(())
    }

    fn emit_all(&self, events: impl IntoIterator<Item = SyncEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    /// 取内存条目，不存在时从 KV 加载
    fn entry_mut<'a>(
        &self,
        items: &'a mut HashMap<String, ItemEntry>,
        item_id: &str,
    ) -> Result<&'a mut ItemEntry> {
        match items.entry(item_id.to_string()) {
            Entry::Occupied(occupied) => Ok(occupied.into_mut()),
            Entry::Vacant(vacant) => {
                let entry = self.read_entry(item_id)?;
                Ok(vacant.insert(entry))
            }
        }
    }

    fn read_entry(&self, item_id: &str) -> Result<ItemEntry> {
        let stored: Option<ProgressRecord> = self.kv.get_lenient(keys::progress(item_id))?;
        let Some(record) = stored else {
            return Ok(ItemEntry::fresh(item_id));
        };
        let pending = self.kv.exists(keys::progress_pending(item_id))?;
        debug!("从本地缓存加载进度: item={}, pending={}", item_id, pending);
        Ok(ItemEntry {
            acknowledged: if pending { None } else { Some(record.clone()) },
            record,
            state: if pending { SyncState::Pending } else { SyncState::Synced },
            last_error: None,
            persisted: true,
            dirty: pending,
            in_flight: false,
            follow_up: false,
            debounce: None,
        })
    }

    /// 写入记录和待同步标记
    fn persist(&self, record: &ProgressRecord) -> Result<()> {
        self.kv.set(keys::progress(&record.item_id), record)?;
        self.kv.set(keys::progress_pending(&record.item_id), &true)?;
        Ok(())
    }

    fn retry_options(&self, item_id: &str) -> RetryOptions {
        let id = item_id.to_string();
        let mut options = RetryOptions::new()
            .with_cancel_token(self.shutdown.child_token())
            .on_retry(move |attempt, e| {
                warn!("⚠️ 进度上报失败，准备重试: item={}, attempt={}, error={}", id, attempt, e);
            });
        if let Some(timeout_ms) = self.config.request_timeout_ms {
            options = options.with_timeout(Duration::from_millis(timeout_ms));
        }
        options
    }

    fn schedule_debounced(self: &Arc<Self>, item_id: &str) {
        let delay = Duration::from_millis(self.config.debounce_ms);
        let inner = Arc::clone(self);
        let id = item_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("防抖到期，开始上报: item={}", id);
            inner.sync_now_detached(&id);
        });

        let mut items = self.items.lock();
        match items.get_mut(item_id) {
            Some(entry) => {
                entry.cancel_debounce();
                entry.debounce = Some(handle);
            }
            None => handle.abort(),
        }
    }

    /// 在途上报的最长耗时：每次尝试的超时加上每次重试的最大等待
    fn drain_bound(&self) -> Duration {
        let policy = self.executor.policy();
        let attempts = u64::from(policy.max_retries) + 1;
        let per_attempt_ms = self.config.request_timeout_ms.unwrap_or(policy.max_delay_ms);
        let total_ms = attempts
            .saturating_mul(per_attempt_ms)
            .saturating_add(u64::from(policy.max_retries).saturating_mul(policy.max_delay_ms));
        Duration::from_millis(total_ms)
    }

    /// 等待所有在途上报结束（含 follow-up）
    async fn drain_in_flight(&self) {
        let mut receiver = self.in_flight_count.subscribe();
        if *receiver.borrow_and_update() == 0 {
            return;
        }
        let bound = self.drain_bound();
        debug!("等待在途上报结束，最长 {}ms", bound.as_millis());
        let drained = tokio::time::timeout(bound, receiver.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if !drained {
            warn!("⚠️ 在途上报未在 {}ms 内结束，将被取消", bound.as_millis());
        }
    }

    fn cancel_all_debounces(&self) {
        for entry in self.items.lock().values_mut() {
            entry.cancel_debounce();
        }
    }

    /// 在独立任务中上报，调用方被取消也不会打断在途请求
    fn spawn_sync(self: &Arc<Self>, item_id: &str) -> JoinHandle<Result<()>> {
        let inner = Arc::clone(self);
        let id = item_id.to_string();
        tokio::spawn(async move { inner.sync_item(&id).await })
    }

    fn sync_now_detached(self: &Arc<Self>, item_id: &str) {
        drop(self.spawn_sync(item_id));
    }

    async fn sync_now(self: &Arc<Self>, item_id: &str) -> Result<()> {
        self.spawn_sync(item_id)
            .await
            .map_err(|e| CourseSyncError::Other(format!("上报任务异常退出: {}", e)))?
    }

    async fn save_all(self: &Arc<Self>) -> Result<()> {
        let dirty: Vec<String> = self
            .items
            .lock()
            .iter()
            .filter(|(_, entry)| entry.dirty && !entry.in_flight)
            .map(|(id, _)| id.clone())
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        info!("批量上报 {} 个待同步条目", dirty.len());

        let handles: Vec<_> = dirty.iter().map(|id| self.spawn_sync(id)).collect();
        let mut first_error = None;
        for result in futures::future::join_all(handles).await {
            let result = result
                .map_err(|e| CourseSyncError::Other(format!("上报任务异常退出: {}", e)))
                .and_then(|r| r);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn resume_pending(self: &Arc<Self>) -> Result<()> {
        let pending_keys = self.kv.keys_with_prefix(keys::PROGRESS_PENDING)?;
        {
            let mut items = self.items.lock();
            for key in &pending_keys {
                if let Some(item_id) = key.strip_prefix(keys::PROGRESS_PENDING) {
                    let entry = self.entry_mut(&mut items, item_id)?;
                    if !entry.dirty && entry.persisted {
                        entry.dirty = true;
                    }
                }
            }
        }
        self.save_all().await
    }

    /// 网络断开：把等待上报的条目标记为离线
    fn mark_offline(&self) {
        let events: Vec<SyncEvent> = {
            let mut items = self.items.lock();
            items
                .values_mut()
                .filter(|entry| entry.dirty && !entry.in_flight)
                .filter_map(|entry| entry.transition(SyncState::Offline, None))
                .collect()
        };
        self.emit_all(events);
    }

    /// 上报单个条目；有 follow-up 请求且仍有修改时继续上报
    async fn sync_item(&self, item_id: &str) -> Result<()> {
        // follow-up 期间沿用计数，不会出现短暂归零
        let mut _slot: Option<InFlightSlot<'_>> = None;
        loop {
            let mut events = Vec::new();
            let payload = {
                let mut items = self.items.lock();
                let Some(entry) = items.get_mut(item_id) else {
                    return Ok(());
                };
                if entry.in_flight {
                    entry.follow_up = true;
                    return Ok(());
                }
                if !entry.dirty {
                    return Ok(());
                }
                if self.shutdown.is_cancelled() {
                    return Err(CourseSyncError::ShuttingDown("progress store".to_string()));
                }
                if !self.network.is_online() {
                    events.extend(entry.transition(SyncState::Offline, None));
                    drop(items);
                    self.stats.lock().syncs_skipped_offline += 1;
                    debug!("离线，进度保留在本地: item={}", item_id);
                    self.emit_all(events);
                    return Ok(());
                }
                entry.cancel_debounce();
                _slot = Some(InFlightSlot::new(&self.in_flight_count));
                entry.in_flight = true;
                entry.follow_up = false;
                entry.dirty = false;
                events.extend(entry.transition(SyncState::Pending, None));
                entry.record.to_payload()
            };
            self.emit_all(events);
            self.stats.lock().syncs_attempted += 1;

            let outcome = self.push(item_id, &payload).await;

            let mut events = Vec::new();
            let (result, again) = {
                let mut items = self.items.lock();
                let Some(entry) = items.get_mut(item_id) else {
                    // 上报期间被 reset
                    return outcome.map(|_| ());
                };
                entry.in_flight = false;
                match outcome {
                    Ok(acknowledged) => {
                        let acknowledged = acknowledged.unwrap_or_else(|| payload.clone());
                        entry.acknowledged = Some(acknowledged.into_record(item_id));
                        if entry.dirty {
                            events.extend(entry.transition(SyncState::Pending, None));
                        } else {
                            if let Err(e) = self.kv.delete(keys::progress_pending(item_id)) {
                                warn!("⚠️ 清除待同步标记失败: item={}, error={}", item_id, e);
                            }
                            events.extend(entry.transition(SyncState::Synced, None));
                        }
                        self.stats.lock().syncs_succeeded += 1;
                        let again = entry.follow_up && entry.dirty;
                        entry.follow_up = false;
                        (Ok(()), again)
                    }
                    Err(e) => {
                        entry.dirty = true;
                        entry.follow_up = false;
                        let next_state = match e.failure_kind() {
                            FailureKind::Cancelled => SyncState::Pending,
                            FailureKind::Transient if !self.network.is_online() => SyncState::Offline,
                            _ => SyncState::Error,
                        };
                        if next_state == SyncState::Error {
                            error!("❌ 进度上报失败: item={}, error={}", item_id, e);
                            self.stats.lock().syncs_failed += 1;
                            events.extend(entry.transition(next_state, Some(e.user_message())));
                        } else {
                            events.extend(entry.transition(next_state, None));
                        }
                        (Err(e), false)
                    }
                }
            };
            self.emit_all(events);

            if result.is_ok() {
                info!("✅ 进度已同步: item={}", item_id);
            }
            if !again {
                return result;
            }
            debug!("执行 follow-up 上报: item={}", item_id);
        }
    }

    async fn push(&self, item_id: &str, payload: &ProgressPayload) -> Result<Option<ProgressPayload>> {
        let api = self.api.clone();
        let id = item_id.to_string();
        let payload = payload.clone();
        self.executor
            .execute(
                move |_token| {
                    let api = api.clone();
                    let id = id.clone();
                    let payload = payload.clone();
                    async move { api.put_progress(&id, &payload).await }
                },
                self.retry_options(item_id),
            )
            .await
    }
}
