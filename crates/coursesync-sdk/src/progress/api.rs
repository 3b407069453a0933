//! 服务端进度接口
//!
//! - `PUT {base}/items/{item_id}/progress` 上报进度，2xx 成功（响应体可选，为服务端确认后的记录）
//! - `GET {base}/items/{item_id}/progress` 拉取服务端副本，404 表示没有记录
//!
//! `item_id` 作为单个路径段编码，`/`、`?`、`#`、`%` 不会改变请求的资源。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, info, warn};

use crate::config::HttpClientConfig;
use crate::error::{CourseSyncError, Result};
use crate::progress::model::ProgressPayload;

/// 进度接口抽象，便于替换为其他传输或测试桩
#[async_trait]
pub trait ProgressApi: Send + Sync {
    /// 上报进度，返回服务端确认后的记录（如果响应体里有）
    async fn put_progress(
        &self,
        item_id: &str,
        payload: &ProgressPayload,
    ) -> Result<Option<ProgressPayload>>;

    /// 拉取服务端保存的进度
    async fn fetch_progress(&self, item_id: &str) -> Result<Option<ProgressPayload>>;
}

/// 基于 reqwest 的进度接口实现
pub struct HttpProgressApi {
    client: Client,
    base_url: Url,
    session_token: Option<String>,
}

impl HttpProgressApi {
    pub fn new(
        config: &HttpClientConfig,
        base_url: impl Into<String>,
        session_token: Option<String>,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| CourseSyncError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.into();
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| CourseSyncError::Config(format!("无效的 API 地址 {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(CourseSyncError::Config(format!("无效的 API 地址: {}", base_url)));
        }
        info!("✅ 进度 HTTP 客户端已创建 (base_url: {})", base_url);
        Ok(Self {
            client,
            base_url,
            session_token,
        })
    }

    fn progress_url(&self, item_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CourseSyncError::Config(format!("无效的 API 地址: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["items", item_id, "progress"]);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.session_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ProgressApi for HttpProgressApi {
    async fn put_progress(
        &self,
        item_id: &str,
        payload: &ProgressPayload,
    ) -> Result<Option<ProgressPayload>> {
        let url = self.progress_url(item_id)?;
        debug!("PUT {}", url);
        let response = self
            .authorize(self.client.put(url).json(payload))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CourseSyncError::from_status(status.as_u16(), message));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice::<ProgressPayload>(&body) {
            Ok(acknowledged) => Ok(Some(acknowledged)),
            Err(e) => {
                // 响应体不是进度记录时以本地上报内容为准
                warn!("⚠️ 无法解析进度确认响应: item={}, error={}", item_id, e);
                Ok(None)
            }
        }
    }

    async fn fetch_progress(&self, item_id: &str) -> Result<Option<ProgressPayload>> {
        let url = self.progress_url(item_id)?;
        debug!("GET {}", url);
        let response = self.authorize(self.client.get(url)).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CourseSyncError::from_status(status.as_u16(), message));
        }
        let payload = response.json::<ProgressPayload>().await?;
        Ok(Some(payload))
    }
}

#[cfg(test)]
pub mod test_helpers {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// 测试用进度接口：按顺序返回预置结果（未预置时返回成功），记录完成的上报
    #[derive(Default)]
    pub struct MockProgressApi {
        calls: Mutex<Vec<(String, ProgressPayload)>>,
        responses: Mutex<VecDeque<Result<Option<ProgressPayload>>>>,
        remote: Mutex<HashMap<String, ProgressPayload>>,
        delay: Option<Duration>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl MockProgressApi {
        /// 每次上报耗时 `delay`，请求完成后才记入 `calls`
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn push_response(&self, response: Result<Option<ProgressPayload>>) {
            self.responses.lock().push_back(response);
        }

        pub fn set_remote(&self, item_id: &str, payload: ProgressPayload) {
            self.remote.lock().insert(item_id.to_string(), payload);
        }

        pub fn calls(&self) -> Vec<(String, ProgressPayload)> {
            self.calls.lock().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        pub fn positions(&self) -> Vec<f64> {
            self.calls.lock().iter().map(|(_, p)| p.position).collect()
        }

        /// 同时在途的上报数量峰值
        pub fn max_active(&self) -> usize {
            self.max_active.load(Ordering::SeqCst)
        }
    }

    struct ActiveGuard<'a>(&'a AtomicUsize);

    impl Drop for ActiveGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ProgressApi for MockProgressApi {
        async fn put_progress(
            &self,
            item_id: &str,
            payload: &ProgressPayload,
        ) -> Result<Option<ProgressPayload>> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = ActiveGuard(&self.active);
            self.max_active.fetch_max(active, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().push((item_id.to_string(), payload.clone()));
            self.responses.lock().pop_front().unwrap_or(Ok(None))
        }

        async fn fetch_progress(&self, item_id: &str) -> Result<Option<ProgressPayload>> {
            Ok(self.remote.lock().get(item_id).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::model::ProgressRecord;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> HttpProgressApi {
        HttpProgressApi::new(
            &HttpClientConfig::default(),
            format!("{}/api/", server.uri()),
            Some("session-abc".to_string()),
        )
        .unwrap()
    }

    fn payload() -> ProgressPayload {
        let mut record = ProgressRecord::new("lec-1");
        record.apply_position(550.0, 600.0, 90.0, 30.0).unwrap();
        record.to_payload()
    }

    #[tokio::test]
    async fn test_put_progress_sends_wire_body() {
        let server = MockServer::start().await;
        let sent = payload();
        Mock::given(method("PUT"))
            .and(path("/api/items/lec-1/progress"))
            .and(header("authorization", "Bearer session-abc"))
            .and(body_partial_json(json!({
                "position": 550.0,
                "duration": 600.0,
                "completionPercent": 91.67,
                "isCompleted": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(&sent))
            .expect(1)
            .mount(&server)
            .await;

        let acknowledged = api(&server).put_progress("lec-1", &sent).await.unwrap();
        assert_eq!(acknowledged, Some(sent));
    }

    #[tokio::test]
    async fn test_put_progress_empty_body_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let acknowledged = api(&server).put_progress("lec-1", &payload()).await.unwrap();
        assert!(acknowledged.is_none());
    }

    #[tokio::test]
    async fn test_put_progress_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/items/busy/progress"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/items/gone/progress"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such item"))
            .mount(&server)
            .await;

        let api = api(&server);
        let busy = api.put_progress("busy", &payload()).await.unwrap_err();
        assert_eq!(busy.status_code(), Some(503));
        assert!(busy.is_retryable());

        let gone = api.put_progress("gone", &payload()).await.unwrap_err();
        assert_eq!(gone.status_code(), Some(404));
        assert!(!gone.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_progress() {
        let server = MockServer::start().await;
        let stored = payload();
        Mock::given(method("GET"))
            .and(path("/api/items/lec-1/progress"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&stored))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/items/new/progress"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = api(&server);
        assert_eq!(api.fetch_progress("lec-1").await.unwrap(), Some(stored));
        assert_eq!(api.fetch_progress("new").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_item_id_is_a_single_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/items/a%2Fb%3Fc/progress"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/items/50%25%23x/progress"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let api = api(&server);
        api.put_progress("a/b?c", &payload()).await.unwrap();
        assert_eq!(api.fetch_progress("50%#x").await.unwrap(), None);
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let result = HttpProgressApi::new(&HttpClientConfig::default(), "not a url", None);
        assert!(matches!(result, Err(CourseSyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_retryable() {
        let api = HttpProgressApi::new(&HttpClientConfig::default(), "http://127.0.0.1:9", None).unwrap();
        let error = api.put_progress("lec-1", &payload()).await.unwrap_err();
        assert!(error.is_retryable(), "unexpected error: {:?}", error);
    }
}
