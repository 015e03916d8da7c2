//! 管线监管：取消令牌与暂停状态
//!
//! 持有根 CancellationToken 的子令牌，采集循环等长期任务从这里领取子令牌；
//! 整体重启期间暂停管线，新帧直接丢弃。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// 管线级生命周期管理：取消令牌与暂停状态
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    paused: Arc<AtomicBool>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// 挂在外部（通常是 ShutdownManager）的令牌下
    pub fn with_token(parent: CancellationToken) -> Self {
        Self {
            cancel_token: parent.child_token(),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 暂停标记在 submit 的同步路径上读取，因此用原子量而不是锁
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// 创建子 token（用于单个长期任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
