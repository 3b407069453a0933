//! 通用重试执行器
//!
//! 对任意异步操作执行有界重试：
//! - 指数退避 + 随机抖动
//! - 可插拔的重试判定（默认：网络/超时/5xx/429 重试，其余 4xx 不重试）
//! - 协作式取消：每次尝试拿到独立的取消令牌，`abort()` 立即中断等待

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CourseSyncError, Result};

/// 重试判定：返回 true 表示该错误可以重试
pub type RetryPredicate = Arc<dyn Fn(&CourseSyncError) -> bool + Send + Sync>;
/// 每次重试前回调（attempt, error）
pub type RetryCallback = Arc<dyn Fn(u32, &CourseSyncError) + Send + Sync>;
/// 重试耗尽回调
pub type ExhaustedCallback = Arc<dyn Fn(&CourseSyncError) + Send + Sync>;

/// 重试策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动比例 (0.0-1.0)，只向上抖动
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 不含抖动的退避延迟：min(base * factor^(attempt-1), max)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis(raw.min(self.max_delay_ms as f64) as u64)
    }

    /// 第 attempt 次失败后的等待时间（含抖动，且不超过 max_delay）
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay(attempt).as_millis() as f64;
        let jitter_max = base_ms * self.jitter_factor;
        let jitter = if jitter_max > 0.0 {
            rand::thread_rng().gen_range(0.0..=jitter_max)
        } else {
            0.0
        };
        Duration::from_millis((base_ms + jitter).min(self.max_delay_ms as f64) as u64)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
            return Err(CourseSyncError::Config(format!(
                "backoff_factor 必须 >= 1.0，当前: {}",
                self.backoff_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(CourseSyncError::Config(format!(
                "jitter_factor 必须在 0.0-1.0 之间，当前: {}",
                self.jitter_factor
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(CourseSyncError::Config(
                "base_delay_ms 不能大于 max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// 单次 execute 调用的重试上下文
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 当前尝试序号（从 1 开始）
    pub attempt: u32,
    /// 最近一次失败
    pub last_error: Option<CourseSyncError>,
    /// 是否还会继续重试
    pub can_retry: bool,
}

impl RetryContext {
    fn new() -> Self {
        Self {
            attempt: 1,
            last_error: None,
            can_retry: true,
        }
    }
}

/// 单次调用的可选覆盖项
#[derive(Clone, Default)]
pub struct RetryOptions {
    policy: Option<RetryPolicy>,
    max_retries: Option<u32>,
    predicate: Option<RetryPredicate>,
    on_retry: Option<RetryCallback>,
    on_exhausted: Option<ExhaustedCallback>,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 整体替换重试策略
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// 自定义重试判定
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CourseSyncError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &CourseSyncError) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn on_exhausted<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CourseSyncError) + Send + Sync + 'static,
    {
        self.on_exhausted = Some(Arc::new(callback));
        self
    }

    /// 单次尝试的超时（超时按可重试错误处理）
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 调用方自己的取消令牌（例如组件销毁时取消）
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// 重试执行器
///
/// 由组件显式持有；`shutdown()`（或 Drop）之后不会再有任何计时器触发。
#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    /// 当前批次的中断令牌，abort() 时整体替换
    abort_token: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    last_context: Mutex<Option<RetryContext>>,
    in_flight: AtomicUsize,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            policy,
            abort_token: Mutex::new(shutdown.child_token()),
            shutdown,
            last_context: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 执行带重试的异步操作
    ///
    /// `operation` 每次尝试都会收到一个新的取消令牌。重试耗尽时返回最后一次的错误。
    pub async fn execute<T, F, Fut>(&self, mut operation: F, options: RetryOptions) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.shutdown.is_cancelled() {
            return Err(CourseSyncError::ShuttingDown("retry executor".to_string()));
        }

        let call_token = self.abort_token.lock().child_token();
        let external = options.cancel.clone();
        let mut policy = options.policy.clone().unwrap_or_else(|| self.policy.clone());
        if let Some(max_retries) = options.max_retries {
            policy.max_retries = max_retries;
        }
        let predicate: RetryPredicate = options
            .predicate
            .clone()
            .unwrap_or_else(|| Arc::new(|e: &CourseSyncError| e.is_retryable()));

        let _in_flight = InFlightGuard::new(&self.in_flight);
        let mut context = RetryContext::new();

        loop {
            let attempt_token = call_token.child_token();
            let result = tokio::select! {
                biased;
                _ = call_token.cancelled() => Err(CourseSyncError::Aborted),
                _ = cancelled_or_pending(&external) => Err(CourseSyncError::Aborted),
                r = run_with_timeout(operation(attempt_token.clone()), options.timeout) => r,
            };
            // 本次尝试结束，释放尝试级资源
            attempt_token.cancel();

            let error = match result {
                Ok(value) => {
                    if context.attempt > 1 {
                        info!("✅ 第 {} 次尝试成功", context.attempt);
                    }
                    context.last_error = None;
                    context.can_retry = false;
                    *self.last_context.lock() = Some(context);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if error.is_aborted() {
                debug!("操作已取消 (attempt={})", context.attempt);
                context.last_error = Some(error.clone());
                context.can_retry = false;
                *self.last_context.lock() = Some(context);
                return Err(error);
            }

            let retryable = context.attempt <= policy.max_retries && predicate(&error);
            context.last_error = Some(error.clone());
            context.can_retry = retryable;
            *self.last_context.lock() = Some(context.clone());

            if !retryable {
                warn!(
                    "⚠️ 重试结束: attempt={}, max_retries={}, error={}",
                    context.attempt, policy.max_retries, error
                );
                if let Some(callback) = &options.on_exhausted {
                    callback(&error);
                }
                return Err(error);
            }

            let delay = policy.delay_for_attempt(context.attempt);
            debug!(
                "第 {} 次尝试失败，{}ms 后重试: {}",
                context.attempt,
                delay.as_millis(),
                error
            );
            if let Some(callback) = &options.on_retry {
                callback(context.attempt, &error);
            }

            tokio::select! {
                biased;
                _ = call_token.cancelled() => return Err(CourseSyncError::Aborted),
                _ = cancelled_or_pending(&external) => return Err(CourseSyncError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
            context.attempt += 1;
        }
    }

    /// 中断当前所有进行中的调用；之后的调用不受影响
    pub fn abort(&self) {
        let mut token = self.abort_token.lock();
        token.cancel();
        *token = self.shutdown.child_token();
        debug!("重试执行器: 已中断进行中的调用");
    }

    /// 销毁：中断进行中的调用并拒绝后续调用
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            debug!("重试执行器已关闭");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 最近一次调用的上下文快照
    pub fn last_context(&self) -> Option<RetryContext> {
        self.last_context.lock().clone()
    }

    /// 是否有调用正处于重试阶段
    pub fn is_retrying(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
            && self
                .last_context
                .lock()
                .as_ref()
                .map(|c| c.can_retry && c.last_error.is_some())
                .unwrap_or(false)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Drop for RetryExecutor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn cancelled_or_pending(token: &Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn run_with_timeout<T, Fut>(future: Fut, timeout: Option<Duration>) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => result,
            Err(_) => Err(CourseSyncError::Timeout(format!(
                "operation exceeded {}ms",
                limit.as_millis()
            ))),
        },
        None => future.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let mut previous = Duration::ZERO;
            for attempt in 1..=12 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay >= previous, "attempt {} went backwards", attempt);
                assert!(delay <= Duration::from_millis(policy.max_delay_ms));
                previous = delay;
            }
        }
        assert_eq!(policy.base_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(4), Duration::from_millis(8000));
        assert_eq!(policy.base_delay(5), Duration::from_millis(10_000));
        assert_eq!(policy.base_delay(60), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_bounded_by_ten_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1).as_millis();
            assert!((1000..=1100).contains(&delay));
        }
    }

    #[test]
    fn test_policy_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            backoff_factor: 0.5,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_four_attempts() {
        let executor = RetryExecutor::new(fast_policy());
        let attempts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(Mutex::new(Vec::new()));
        let exhausted = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let retries_seen = retries.clone();
        let exhausted_seen = exhausted.clone();
        let result: Result<()> = executor
            .execute(
                |_token| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(CourseSyncError::Network("unreachable".into()))
                    }
                },
                RetryOptions::new()
                    .with_predicate(|_| true)
                    .on_retry(move |attempt, _| retries_seen.lock().push(attempt))
                    .on_exhausted(move |_| {
                        exhausted_seen.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .await;

        assert!(matches!(result, Err(CourseSyncError::Network(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(*retries.lock(), vec![1, 2, 3]);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);

        let context = executor.last_context().unwrap();
        assert_eq!(context.attempt, 4);
        assert!(!context.can_retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_short_circuits() {
        let executor = RetryExecutor::new(fast_policy());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = executor
            .execute(
                |_token| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(CourseSyncError::from_status(404, "not found"))
                    }
                },
                RetryOptions::new(),
            )
            .await;

        assert_eq!(result.unwrap_err().status_code(), Some(404));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let executor = RetryExecutor::new(fast_policy());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let value = executor
            .execute(
                |_token| {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 3 {
                            Err(CourseSyncError::from_status(503, "busy"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                RetryOptions::new(),
            )
            .await;

        tokio_test::assert_ok!(&value);
        assert_eq!(value.unwrap(), 3);
        let context = executor.last_context().unwrap();
        assert!(context.last_error.is_none());
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_interrupts_backoff_wait() {
        let executor = Arc::new(RetryExecutor::new(RetryPolicy {
            base_delay_ms: 5_000,
            max_delay_ms: 10_000,
            ..fast_policy()
        }));
        let attempts = Arc::new(AtomicU32::new(0));

        let runner = executor.clone();
        let counter = attempts.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            runner
                .execute(
                    |_token| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(CourseSyncError::Timeout("slow".into()))
                        }
                    },
                    RetryOptions::new(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        executor.abort();
        let result = handle.await.unwrap();

        assert!(matches!(result, Err(CourseSyncError::Aborted)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));

        // abort 之后的新调用不受影响
        let value = executor
            .execute(|_token| async { Ok(7) }, RetryOptions::new())
            .await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let executor = RetryExecutor::new(fast_policy());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = executor
            .execute(
                |_token| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    }
                },
                RetryOptions::new()
                    .with_max_retries(1)
                    .with_timeout(Duration::from_secs(1)),
            )
            .await;

        assert!(matches!(result, Err(CourseSyncError::Timeout(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_token() {
        let executor = RetryExecutor::new(fast_policy());
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<()> = executor
            .execute(
                |_token| async { Err(CourseSyncError::Network("down".into())) },
                RetryOptions::new().with_cancel_token(token),
            )
            .await;
        assert!(matches!(result, Err(CourseSyncError::Aborted)));
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let executor = RetryExecutor::default();
        executor.shutdown();
        let result = executor
            .execute(|_token| async { Ok(()) }, RetryOptions::new())
            .await;
        assert!(matches!(result, Err(CourseSyncError::ShuttingDown(_))));
    }
}
