//! 阶段调度：Vision / Decision 单飞，Learning 有界并发
//!
//! 每个阶段一个 Semaphore：Vision 与 Decision 只有 1 个许可，拿不到许可即说明已有周期在执行，调用方直接返回；
//! 许可随工作任务移动，任务结束（包括出错、panic）时自动释放。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 阶段类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    /// 视觉处理，单飞
    Vision,
    /// 决策融合，单飞
    Decision,
    /// 在线学习，有界并发
    Learning,
}

/// 阶段许可：持有期间该阶段被占用
#[derive(Debug)]
pub struct StagePermit {
    _permit: OwnedSemaphorePermit,
}

/// 阶段调度器
#[derive(Debug)]
pub struct TaskScheduler {
    vision: Arc<Semaphore>,
    decision: Arc<Semaphore>,
    learning: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(learning_workers: usize) -> Self {
        Self {
            vision: Arc::new(Semaphore::new(1)),
            decision: Arc::new(Semaphore::new(1)),
            learning: Arc::new(Semaphore::new(learning_workers.max(1))),
        }
    }

    fn semaphore(&self, kind: TaskKind) -> &Arc<Semaphore> {
        match kind {
            TaskKind::Vision => &self.vision,
            TaskKind::Decision => &self.decision,
            TaskKind::Learning => &self.learning,
        }
    }

    /// 非阻塞获取阶段许可；阶段已满时返回 None
    pub fn try_acquire(&self, kind: TaskKind) -> Option<StagePermit> {
        let permit = self.semaphore(kind).clone().try_acquire_owned().ok()?;
        Some(StagePermit { _permit: permit })
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(2)
    }
}
