//! 进度数据模型
//!
//! `ProgressRecord` 是本地持久化格式（camelCase JSON），`ProgressPayload` 是上报给服务端的请求体。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CourseSyncError, Result};

/// 单个条目（课时/视频）的学习进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub item_id: String,
    pub position_seconds: f64,
    /// 0 表示时长未知
    pub duration_seconds: f64,
    pub completion_percent: f64,
    /// 一旦置为 true 不再回退
    pub is_completed: bool,
    /// 累计观看时长，只增不减
    pub accumulated_watch_seconds: f64,
    pub last_updated: DateTime<Utc>,
}

/// 一次进度更新的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressChange {
    /// 本次更新是否首次跨过完成阈值
    pub crossed_threshold: bool,
    /// 本次累加的观看时长
    pub watch_delta: f64,
}

impl ProgressRecord {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            position_seconds: 0.0,
            duration_seconds: 0.0,
            completion_percent: 0.0,
            is_completed: false,
            accumulated_watch_seconds: 0.0,
            last_updated: Utc::now(),
        }
    }

    /// 应用一次播放位置上报
    ///
    /// 只有向前且不超过 `max_watch_delta` 的位移计入观看时长，拖动进度条/切页造成的跳变被忽略。
    pub fn apply_position(
        &mut self,
        position: f64,
        duration: f64,
        completion_threshold: f64,
        max_watch_delta: f64,
    ) -> Result<ProgressChange> {
        validate_seconds("position", position)?;
        validate_seconds("duration", duration)?;

        let delta = position - self.position_seconds;
        let watch_delta = if delta > 0.0 && delta <= max_watch_delta {
            delta
        } else {
            0.0
        };

        let was_completed = self.is_completed;
        self.position_seconds = position;
        self.duration_seconds = duration;
        let raw_percent = raw_completion_percent(position, duration);
        self.completion_percent = round_percent(raw_percent);
        self.accumulated_watch_seconds += watch_delta;
        if raw_percent >= completion_threshold {
            self.is_completed = true;
        }
        self.last_updated = Utc::now();

        Ok(ProgressChange {
            crossed_threshold: !was_completed && self.is_completed,
            watch_delta,
        })
    }

    /// 强制标记完成
    pub fn mark_completed(&mut self) {
        self.completion_percent = 100.0;
        self.is_completed = true;
        if self.duration_seconds > 0.0 {
            self.position_seconds = self.position_seconds.max(self.duration_seconds);
        }
        self.last_updated = Utc::now();
    }

    pub fn to_payload(&self) -> ProgressPayload {
        ProgressPayload {
            position: self.position_seconds,
            duration: self.duration_seconds,
            completion_percent: self.completion_percent,
            is_completed: self.is_completed,
            watch_seconds: self.accumulated_watch_seconds,
            last_updated: self.last_updated,
        }
    }
}

/// 服务端进度接口的请求/响应体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub position: f64,
    pub duration: f64,
    pub completion_percent: f64,
    pub is_completed: bool,
    pub watch_seconds: f64,
    pub last_updated: DateTime<Utc>,
}

impl ProgressPayload {
    pub fn into_record(self, item_id: impl Into<String>) -> ProgressRecord {
        ProgressRecord {
            item_id: item_id.into(),
            position_seconds: self.position,
            duration_seconds: self.duration,
            completion_percent: self.completion_percent,
            is_completed: self.is_completed,
            accumulated_watch_seconds: self.watch_seconds,
            last_updated: self.last_updated,
        }
    }
}

/// 完成百分比，保留两位小数，时长未知时为 0
pub fn completion_percent(position: f64, duration: f64) -> f64 {
    round_percent(raw_completion_percent(position, duration))
}

/// 未取整的完成百分比，完成阈值按这个值判断
fn raw_completion_percent(position: f64, duration: f64) -> f64 {
    if duration <= 0.0 {
        return 0.0;
    }
    (position / duration * 100.0).min(100.0)
}

fn round_percent(percent: f64) -> f64 {
    (percent * 100.0).round() / 100.0
}

fn validate_seconds(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(CourseSyncError::Validation(format!(
            "{} 必须是非负有限数，当前: {}",
            field, value
        )));
    }
    Ok(())
}
