//! SDK 配置
//!
//! 所有配置都有默认值，可通过 `SyncConfig::builder()` 覆盖，也可以从 JSON 读取。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CourseSyncError, Result};
use crate::retry::RetryPolicy;

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 进度存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// 自动保存防抖时间（毫秒）
    pub debounce_ms: u64,
    /// 完成阈值（百分比）
    pub completion_threshold: f64,
    /// 单次观看时长增量上限（秒），超过视为切页等异常跳变
    pub max_watch_delta_secs: f64,
    /// 单次上报请求超时（毫秒）
    pub request_timeout_ms: Option<u64>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 10_000,
            completion_threshold: 90.0,
            max_watch_delta_secs: 30.0,
            request_timeout_ms: Some(15_000),
        }
    }
}

/// 长连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 最大连续重连失败次数
    pub max_reconnect_attempts: u32,
    /// 初始重连间隔（毫秒）
    pub reconnect_base_delay_ms: u64,
    /// 最大重连间隔（毫秒）
    pub reconnect_max_delay_ms: u64,
    /// 退避倍数
    pub backoff_factor: f64,
    /// 通知队列容量
    pub notification_capacity: usize,
    /// 需要转成通知的事件类型
    pub notification_event_types: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            backoff_factor: 2.0,
            notification_capacity: 50,
            notification_event_types: vec![
                "payment_success".to_string(),
                "payment_failed".to_string(),
                "payment_refunded".to_string(),
                "payout_processed".to_string(),
                "enrollment_created".to_string(),
                "course_completed".to_string(),
            ],
        }
    }
}

impl ConnectionConfig {
    /// 重连退避策略（与重试执行器同一套退避公式）
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_reconnect_attempts,
            base_delay_ms: self.reconnect_base_delay_ms,
            max_delay_ms: self.reconnect_max_delay_ms,
            backoff_factor: self.backoff_factor,
            jitter_factor: 0.1,
        }
    }
}

/// SDK 总配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// KV 命名空间（通常是当前用户）
    pub namespace: String,
    /// 进度接口基础 URL，例如 https://api.example.com/api
    pub api_base_url: String,
    /// 会话凭证（HTTP Bearer 与长连接认证共用）
    pub session_token: Option<String>,
    /// 重试配置
    pub retry: RetryPolicy,
    /// 进度存储配置
    pub progress: ProgressConfig,
    /// 长连接配置
    pub connection: ConnectionConfig,
    /// HTTP 客户端配置
    pub http: HttpClientConfig,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            namespace: "default".to_string(),
            api_base_url: "http://localhost:8080/api".to_string(),
            session_token: None,
            retry: RetryPolicy::default(),
            progress: ProgressConfig::default(),
            connection: ConnectionConfig::default(),
            http: HttpClientConfig::default(),
            event_buffer_size: 256,
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.coursesync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".coursesync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".coursesync")
    } else {
        PathBuf::from("./coursesync_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 从 JSON 读取配置，缺省字段使用默认值
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(json)
            .map_err(|e| CourseSyncError::Config(format!("解析配置失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(CourseSyncError::Config("api_base_url 不能为空".to_string()));
        }
        if self.namespace.trim().is_empty() {
            return Err(CourseSyncError::Config("namespace 不能为空".to_string()));
        }
        self.retry.validate()?;
        self.connection.reconnect_policy().validate()?;
        if !(0.0..=100.0).contains(&self.progress.completion_threshold) {
            return Err(CourseSyncError::Config(format!(
                "completion_threshold 必须在 0-100 之间，当前: {}",
                self.progress.completion_threshold
            )));
        }
        if self.progress.max_watch_delta_secs <= 0.0 {
            return Err(CourseSyncError::Config(
                "max_watch_delta_secs 必须大于 0".to_string(),
            ));
        }
        if self.connection.notification_capacity == 0 {
            return Err(CourseSyncError::Config(
                "notification_capacity 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// SDK 配置构建器
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn session_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.session_token = Some(token.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn progress_config(mut self, config: ProgressConfig) -> Self {
        self.config.progress = config;
        self
    }

    /// 自动保存防抖时间（毫秒）
    pub fn debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.config.progress.debounce_ms = debounce_ms;
        self
    }

    pub fn completion_threshold(mut self, threshold: f64) -> Self {
        self.config.progress.completion_threshold = threshold;
        self
    }

    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    pub fn http_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http = config;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }

    /// 构建并校验
    pub fn try_build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
