//! 采集循环：按固定节奏从帧来源取帧并提交给管线
//!
//! 作为 Capture 层的受管服务登记，恢复与整体重启通过 stop/start 重建循环。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::Capture;
use crate::config::PipelineSection;
use crate::core::SessionSupervisor;
use crate::health::HealthMonitor;
use crate::pipeline::FramePipeline;
use crate::recovery::{ComponentCategory, ManagedComponent, StartupTier};

pub const CAPTURE_SERVICE: &str = "capture";

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CaptureLoop {
    capture: Arc<dyn Capture>,
    pipeline: Arc<FramePipeline>,
    supervisor: SessionSupervisor,
    interval: Duration,
    session: Option<Duration>,
    health: Option<Arc<HealthMonitor>>,
    running: Mutex<Option<Running>>,
    frames_captured: Arc<AtomicU64>,
    session_ended: Arc<AtomicBool>,
}

impl CaptureLoop {
    pub fn new(
        cfg: &PipelineSection,
        capture: Arc<dyn Capture>,
        pipeline: Arc<FramePipeline>,
        supervisor: SessionSupervisor,
    ) -> Self {
        Self {
            capture,
            pipeline,
            supervisor,
            interval: cfg.frame_interval(),
            session: cfg.capture_session_secs.map(Duration::from_secs),
            health: None,
            running: Mutex::new(None),
            frames_captured: Arc::new(AtomicU64::new(0)),
            session_ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    fn spawn_loop(&self, token: CancellationToken) -> JoinHandle<()> {
        let capture = Arc::clone(&self.capture);
        let pipeline = Arc::clone(&self.pipeline);
        let health = self.health.clone();
        let captured = Arc::clone(&self.frames_captured);
        let session_ended = Arc::clone(&self.session_ended);
        let interval = self.interval;
        let deadline = self.session.map(|d| Instant::now() + d);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!("Capture loop started ({:?} per frame)", interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    tracing::info!("Capture session lifetime reached");
                    session_ended.store(true, Ordering::SeqCst);
                    break;
                }

                match capture.next_frame().await {
                    Ok(frame) => {
                        captured.fetch_add(1, Ordering::Relaxed);
                        let _ = pipeline.submit(frame);
                    }
                    Err(e) => {
                        tracing::warn!("Capture failed: {}", e);
                        if let Some(health) = &health {
                            health
                                .report_service_issue(CAPTURE_SERVICE, &e.to_string())
                                .await;
                        }
                    }
                }
            }
            tracing::info!("Capture loop stopped");
        })
    }
}

#[async_trait]
impl ManagedComponent for CaptureLoop {
    fn name(&self) -> &str {
        CAPTURE_SERVICE
    }

    fn category(&self) -> ComponentCategory {
        ComponentCategory::Service
    }

    fn tier(&self) -> StartupTier {
        StartupTier::Capture
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Ok(());
        }
        if self.supervisor.is_cancelled() {
            anyhow::bail!("session cancelled, capture not restarted");
        }
        self.session_ended.store(false, Ordering::SeqCst);
        let token = self.supervisor.child_token();
        let handle = self.spawn_loop(token.clone());
        *running = Some(Running { token, handle });
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let taken = self.running.lock().await.take();
        if let Some(Running { token, handle }) = taken {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("Capture loop ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    /// 循环意外退出（不是到达会话时长）时视为不健康
    async fn health_check(&self) -> anyhow::Result<()> {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(r) if r.handle.is_finished() && !self.session_ended.load(Ordering::SeqCst) => {
                anyhow::bail!("capture loop exited unexpectedly")
            }
            _ => Ok(()),
        }
    }
}
