//! 优雅关闭
//!
//! 统一的关闭信号与清理流程：
//! - 取消根令牌，采集循环与探测循环随之退出
//! - 按启动顺序的逆序停止受管组件
//! - 最后关闭总线，已入队的消息处理完再退出
//! - 释放所有登记的帧缓冲

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::recovery::{BufferTracker, ComponentRegistry};

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 根取消令牌；监管器、采集循环、探测循环都从它派生
    shutdown_token: CancellationToken,
    /// 关闭原因广播，只发送第一次的原因
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C 或调用方主动关闭
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 配置的运行时长已到
    RunCompleted,
    /// 整体重启失败等无法继续运行的错误
    FatalError(String),
}

impl ShutdownManager {
    /// 创建关闭管理器，根令牌尚未取消
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 根令牌；管线监管从这里派生子令牌
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭；重复调用被忽略，第一次的原因生效
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        tracing::info!("Shutdown requested: {:?}", reason);
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    /// 是否已触发关闭
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 订阅关闭原因
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 等待根令牌被取消
    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    /// 执行清理；返回错误只记录日志，不影响后续清理任务
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务，每个任务单独限时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 单个清理任务的超时（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    /// 创建关闭协调器，默认每个任务限时 5 秒
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    /// 设置单个清理任务的超时（app.shutdown_timeout_secs）
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// 注册清理任务；执行顺序即注册顺序
    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 依次执行所有清理任务，失败或超时的任务跳过
    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }

    /// 获取关闭管理器
    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 按启动顺序的逆序停止所有受管组件
pub struct ComponentShutdown {
    registry: Arc<ComponentRegistry>,
}

impl ComponentShutdown {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ComponentShutdown {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let mut failed = Vec::new();
        for component in self.registry.in_start_order().await.iter().rev() {
            if let Err(e) = component.stop().await {
                tracing::warn!("Stopping '{}' failed: {:#}", component.name(), e);
                failed.push(component.name().to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("components failed to stop: {}", failed.join(", "))
        }
    }

    fn name(&self) -> &'static str {
        "Components"
    }
}

/// 等待后台任务（总线出队、健康探测）退出；可先取消其专用令牌
pub struct TaskDrain {
    name: &'static str,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    cancel: Option<CancellationToken>,
}

impl TaskDrain {
    pub fn new(name: &'static str, handles: Arc<Mutex<Vec<JoinHandle<()>>>>) -> Self {
        Self {
            name,
            handles,
            cancel: None,
        }
    }

    /// 等待之前先取消该令牌（总线出队任务使用独立令牌）
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for TaskDrain {
    async fn cleanup(&self) -> anyhow::Result<()> {
        if let Some(token) = &self.cancel {
            token.cancel();
        }
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            handle.await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// 释放所有登记的帧缓冲
pub struct BufferPurge {
    memory: Arc<BufferTracker>,
}

impl BufferPurge {
    pub fn new(memory: Arc<BufferTracker>) -> Self {
        Self { memory }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for BufferPurge {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let freed = self.memory.purge_all();
        tracing::debug!("Purged {} bytes of frame buffers", freed);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Buffers"
    }
}

/// 运行主应用直到结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}
