use thiserror::Error;

/// SDK 统一错误类型
#[derive(Debug, Clone, Error)]
pub enum CourseSyncError {
    /// 网络不可达、连接被重置等
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    /// 服务端返回非 2xx 状态码
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// 客户端参数校验失败（不会重试）
    #[error("Validation error: {0}")]
    Validation(String),
    /// 调用被主动取消
    #[error("Operation aborted")]
    Aborted,
    #[error("Not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
    #[error("Other error: {0}")]
    Other(String),
}

/// 失败分类
///
/// 决定一个错误是自动重试、直接上报，还是视为取消。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 临时故障：超时、5xx、429、网络不可用 → 重试
    Transient,
    /// 永久故障：4xx、参数错误、数据格式错误 → 不重试
    Permanent,
    /// 主动取消 → 不重试，也不算失败
    Cancelled,
}

impl CourseSyncError {
    /// 根据 HTTP 状态码创建错误
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        CourseSyncError::Http {
            status,
            message: message.into(),
        }
    }

    /// HTTP 状态码（仅 Http 错误有）
    pub fn status_code(&self) -> Option<u16> {
        match self {
            CourseSyncError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, CourseSyncError::Aborted)
    }

    /// 错误分类
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CourseSyncError::Aborted | CourseSyncError::ShuttingDown(_) => FailureKind::Cancelled,
            CourseSyncError::Network(_)
            | CourseSyncError::Timeout(_)
            | CourseSyncError::NotConnected
            | CourseSyncError::Transport(_) => FailureKind::Transient,
            CourseSyncError::Http { status, .. } => {
                // 5xx 和 429 可重试，其余 4xx 视为永久错误
                if *status == 429 || (500..600).contains(status) {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                }
            }
            _ => FailureKind::Permanent,
        }
    }

    /// 默认重试判定
    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }

    /// 面向用户的提示文案
    pub fn user_message(&self) -> String {
        match self.failure_kind() {
            FailureKind::Transient => {
                "Progress could not reach the server; it is saved on this device and will sync automatically."
                    .to_string()
            }
            FailureKind::Cancelled => "Sync was cancelled.".to_string(),
            FailureKind::Permanent => format!("Progress sync failed: {}", self),
        }
    }
}

impl From<serde_json::Error> for CourseSyncError {
    fn from(error: serde_json::Error) -> Self {
        CourseSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for CourseSyncError {
    fn from(error: std::io::Error) -> Self {
        CourseSyncError::IO(error.to_string())
    }
}

impl From<sled::Error> for CourseSyncError {
    fn from(error: sled::Error) -> Self {
        CourseSyncError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for CourseSyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            CourseSyncError::Timeout(error.to_string())
        } else if let Some(status) = error.status() {
            CourseSyncError::from_status(status.as_u16(), error.to_string())
        } else if error.is_connect() || error.is_request() {
            CourseSyncError::Network(error.to_string())
        } else if error.is_decode() || error.is_body() {
            CourseSyncError::Serialization(error.to_string())
        } else {
            CourseSyncError::Network(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CourseSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_classification() {
        assert!(CourseSyncError::Network("reset".into()).is_retryable());
        assert!(CourseSyncError::Timeout("10s".into()).is_retryable());
        assert!(CourseSyncError::from_status(500, "boom").is_retryable());
        assert!(CourseSyncError::from_status(503, "unavailable").is_retryable());
        assert!(CourseSyncError::from_status(429, "slow down").is_retryable());

        assert!(!CourseSyncError::from_status(404, "missing").is_retryable());
        assert!(!CourseSyncError::from_status(400, "bad").is_retryable());
        assert!(!CourseSyncError::from_status(401, "auth").is_retryable());
        assert!(!CourseSyncError::Validation("negative".into()).is_retryable());

        assert_eq!(CourseSyncError::Aborted.failure_kind(), FailureKind::Cancelled);
        assert!(!CourseSyncError::Aborted.is_retryable());
    }

    #[test]
    fn test_status_code() {
        assert_eq!(CourseSyncError::from_status(429, "").status_code(), Some(429));
        assert_eq!(CourseSyncError::NotConnected.status_code(), None);
    }
}
