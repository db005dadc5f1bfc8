// 上传任务定义
//
// 状态机：uploading ⇄ paused，uploading → done / error（终态）

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 上传中（包括指纹计算和检查阶段）
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成（包括秒传）
    Done,
    /// 失败
    Error,
}

impl UploadTaskStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadTaskStatus::Done | UploadTaskStatus::Error)
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 原始文件名（发送给接收端）
    pub name: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 文件大小
    pub total_size: u64,
    /// 文件指纹，计算一次后不再变化
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 进度百分比 (0-100)，只增不减
    pub percent: u8,
    /// 错误信息
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 是否命中秒传（接收端已有完整文件）
    #[serde(default)]
    pub is_rapid_upload: bool,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(local_path: PathBuf, name: String, total_size: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            local_path,
            total_size,
            fingerprint: None,
            status: UploadTaskStatus::Uploading,
            percent: 0,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
            is_rapid_upload: false,
        }
    }

    /// 设置指纹，已有指纹时保持不变
    pub fn set_fingerprint(&mut self, fingerprint: String) {
        if self.fingerprint.is_none() {
            self.fingerprint = Some(fingerprint);
        }
    }

    /// 更新进度，返回进度是否增加
    pub fn advance_percent(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if percent > self.percent {
            self.percent = percent;
            true
        } else {
            false
        }
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        self.status = UploadTaskStatus::Uploading;
        self.error = None;
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        self.status = UploadTaskStatus::Paused;
    }

    /// 标记为已完成
    pub fn mark_done(&mut self) {
        self.status = UploadTaskStatus::Done;
        self.percent = 100;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为秒传成功
    pub fn mark_rapid_upload_success(&mut self) {
        self.is_rapid_upload = true;
        self.mark_done();
    }

    /// 标记为失败
    pub fn mark_error(&mut self, error: String) {
        self.status = UploadTaskStatus::Error;
        self.error = Some(error);
    }
}
