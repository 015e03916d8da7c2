//! 总线消息定义

use serde::Serialize;
use tokio::time::Instant;

/// 订阅所有类型时使用的通配类型
pub const ANY_TYPE: &str = "*";

/// 组件之间发布状态时使用的消息类型
pub mod kinds {
    pub const DECISION: &str = "decision";
    pub const STATE_UPDATED: &str = "state_updated";
    pub const HEALTH_CHANGED: &str = "health_changed";
    pub const SERVICE_FAILED: &str = "service_failed";
    pub const SERVICE_RECOVERED: &str = "service_recovered";
    pub const RECOVERY: &str = "recovery";
    pub const FULL_RESTART: &str = "full_restart";
    pub const SYNC_ERROR: &str = "sync_error";
}

/// 已入队、等待按序处理的消息
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// 单调递增的序号，出队顺序与序号顺序一致
    pub seq: u64,
    pub sender: String,
    pub receiver: String,
    pub msg_type: String,
    pub payload: serde_json::Value,
    pub enqueued_at: Instant,
}

/// 去重键：(sender, receiver, type)，不含 payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub sender: String,
    pub receiver: String,
    pub msg_type: String,
}

impl DedupKey {
    pub fn new(sender: &str, receiver: &str, msg_type: &str) -> Self {
        Self {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            msg_type: msg_type.to_string(),
        }
    }
}

/// send 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    Queued { seq: u64 },
    /// 去重窗口内已发送过相同键
    Duplicate,
    /// 总线已关闭
    Closed,
}

impl SendOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SendOutcome::Queued { .. })
    }
}
