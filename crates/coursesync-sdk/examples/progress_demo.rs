//! 进度同步演示
//!
//! 使用内存中的进度接口演示：本地落盘、防抖上报、离线排队、完成阈值立即上报、重试执行器。
//!
//! 运行：`cargo run --example progress_demo`

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coursesync_sdk::{
    CourseSyncClient, CourseSyncError, NetworkStatus, PlatformHooks, ProgressApi,
    ProgressPayload, Result, RetryExecutor, RetryOptions, RetryPolicy, SyncConfig,
};
use tracing::info;

/// 打印每次上报，第一次请求返回 503 以演示自动重试
#[derive(Default)]
struct LoopbackApi {
    requests: AtomicU32,
}

#[async_trait]
impl ProgressApi for LoopbackApi {
    async fn put_progress(
        &self,
        item_id: &str,
        payload: &ProgressPayload,
    ) -> Result<Option<ProgressPayload>> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            println!("   ⚠️ 服务端繁忙 (503)");
            return Err(CourseSyncError::from_status(503, "busy"));
        }
        println!(
            "   📤 PUT /items/{}/progress position={} completion={}% completed={}",
            item_id, payload.position, payload.completion_percent, payload.is_completed
        );
        Ok(Some(payload.clone()))
    }

    async fn fetch_progress(&self, _item_id: &str) -> Result<Option<ProgressPayload>> {
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("🚀 CourseSync SDK 进度同步演示");
    println!("==============================\n");

    let data_dir = std::env::temp_dir().join("coursesync-demo");
    let config = SyncConfig::builder()
        .data_dir(&data_dir)
        .namespace("demo-student")
        .debounce_ms(1_000)
        .try_build()?;

    let api = Arc::new(LoopbackApi::default());
    let hooks = PlatformHooks {
        progress_api: Some(api.clone()),
        ..PlatformHooks::default()
    };
    let client = CourseSyncClient::initialize(config, hooks).await?;

    client.events().add_listener("progress_sync_state_changed", |event| {
        info!("事件: {:?}", event);
    });

    println!("📋 示例1: 连续上报，防抖合并为一次请求");
    for position in [10.0, 20.0, 30.0] {
        client.progress().update_progress("lec-2", position, 600.0)?;
    }
    tokio::time::sleep(Duration::from_secs(3)).await;

    println!("\n📋 示例2: 离线时只写本地，恢复网络后补传");
    client.set_network_status(NetworkStatus::Offline);
    client.progress().update_progress("lec-3", 45.0, 600.0)?;
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    println!("   状态: {:?}", client.progress().status("lec-3"));
    client.set_network_status(NetworkStatus::Online);
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("\n📋 示例3: 跨过完成阈值立即上报");
    let record = client.progress().update_progress("lec-1", 550.0, 600.0)?;
    println!("   completion={}%, completed={}", record.completion_percent, record.is_completed);
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("\n📋 示例4: 直接使用重试执行器");
    let executor = RetryExecutor::new(RetryPolicy {
        base_delay_ms: 100,
        ..RetryPolicy::default()
    });
    let attempts = Arc::new(AtomicU32::new(0));
    let value = executor
        .execute(
            |_token| {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(CourseSyncError::Timeout(format!("attempt {}", n)))
                    } else {
                        Ok(n)
                    }
                }
            },
            RetryOptions::new().on_retry(|attempt, error| {
                println!("   🔁 第 {} 次失败: {}", attempt, error);
            }),
        )
        .await?;
    println!("   ✅ 第 {} 次尝试成功", value);

    println!("\n📊 统计: {:?}", client.progress().stats());
    client.shutdown().await?;
    println!("\n🎉 演示完成！");
    Ok(())
}
