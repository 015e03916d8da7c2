//! 帧处理：单飞的视觉阶段
//!
//! submit 从不阻塞：视觉阶段忙、管线暂停或未就绪时直接丢帧。
//! 被接受的帧在后台任务中依次完成：缓冲租借 → 检测 → 写共享状态 → 通知 → 触发决策。
//! 缓冲超出预算时先触发强制清理，再以降采样的副本继续处理；副本也放不下才丢弃这一帧。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::json;
use tokio::task::JoinHandle;

use super::decision::DecisionSynchronizer;
use super::events::Listeners;
use super::stats::PipelineStats;
use crate::bus::{kinds, OrderedMessageBus};
use crate::core::{GameState, PilotError, SessionSupervisor, SharedGameState, TaskKind, TaskScheduler};
use crate::health::HealthMonitor;
use crate::perception::{Detector, FrameBuffer};
use crate::recovery::{BufferLease, BufferTracker, RecoveryCause, RecoveryCoordinator};

pub const DETECTOR_SERVICE: &str = "detector";
pub const MEMORY_SERVICE: &str = "memory";

const BUS_SENDER: &str = "vision";
const BUS_RECEIVER: &str = "status";

/// 帧被拒绝的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRejected {
    /// 上一帧仍在处理
    Busy,
    /// 整体重启期间
    Paused,
    /// 尚未注册策略
    NotReady,
}

pub struct FramePipeline {
    detector: Arc<dyn Detector>,
    state: Arc<SharedGameState>,
    scheduler: Arc<TaskScheduler>,
    decisions: Arc<DecisionSynchronizer>,
    memory: Arc<BufferTracker>,
    supervisor: SessionSupervisor,
    listeners: Listeners,
    stats: Arc<PipelineStats>,
    health: Option<Arc<HealthMonitor>>,
    recovery: Option<Arc<RecoveryCoordinator>>,
    bus: Option<Arc<OrderedMessageBus>>,
}

impl FramePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        detector: Arc<dyn Detector>,
        state: Arc<SharedGameState>,
        scheduler: Arc<TaskScheduler>,
        decisions: Arc<DecisionSynchronizer>,
        memory: Arc<BufferTracker>,
        supervisor: SessionSupervisor,
        listeners: Listeners,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            detector,
            state,
            scheduler,
            decisions,
            memory,
            supervisor,
            listeners,
            stats,
            health: None,
            recovery: None,
            bus: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<RecoveryCoordinator>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_bus(mut self, bus: Arc<OrderedMessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn decisions(&self) -> &Arc<DecisionSynchronizer> {
        &self.decisions
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// 提交一帧；接受时返回处理任务句柄
    pub fn submit(self: &Arc<Self>, frame: FrameBuffer) -> Result<JoinHandle<()>, FrameRejected> {
        self.stats.frame_submitted();

        let rejected = if self.supervisor.is_paused() {
            Some(FrameRejected::Paused)
        } else if !self.decisions.is_ready() {
            Some(FrameRejected::NotReady)
        } else {
            None
        };
        if let Some(reason) = rejected {
            self.stats.frame_dropped();
            tracing::trace!("Frame {} dropped: {:?}", frame.seq, reason);
            return Err(reason);
        }

        let Some(permit) = self.scheduler.try_acquire(TaskKind::Vision) else {
            self.stats.frame_dropped();
            tracing::trace!("Frame {} dropped: vision stage busy", frame.seq);
            return Err(FrameRejected::Busy);
        };
        self.stats.frame_accepted();

        let pipeline = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _permit = permit;
            let seq = frame.seq;
            match AssertUnwindSafe(pipeline.process(frame)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!("Frame {} failed ({:?})", seq, e.class());
                    pipeline
                        .report_error(&format!("frame {seq}: {e}"))
                        .await;
                }
                Err(_) => {
                    pipeline
                        .report_error(&format!("frame {seq}: vision worker panicked"))
                        .await;
                }
            }
        }))
    }

    async fn process(&self, frame: FrameBuffer) -> Result<(), PilotError> {
        let (frame, _lease) = match self.memory.retain(Arc::clone(&frame.data)) {
            Ok(lease) => (frame, lease),
            Err(e) => {
                self.on_memory_exhausted(&e).await;
                self.reduced_capacity(&frame).ok_or(e)?
            }
        };

        let entities = match self.detector.detect(&frame).await {
            Ok(entities) => entities,
            Err(e) => {
                self.stats.detection_failed();
                if let Some(health) = &self.health {
                    health
                        .report_service_issue(DETECTOR_SERVICE, &e.to_string())
                        .await;
                }
                return Err(e);
            }
        };
        if let Some(health) = &self.health {
            health.report_service_healthy(DETECTOR_SERVICE).await;
        }

        let new_state = GameState::new(entities, frame.captured_at_ms, frame.seq);
        self.state.replace(new_state.clone()).await;
        self.listeners.state_updated(&new_state).await;
        if let Some(bus) = &self.bus {
            bus.send(
                BUS_SENDER,
                BUS_RECEIVER,
                kinds::STATE_UPDATED,
                json!({ "frame_seq": new_state.frame_seq, "entities": new_state.entity_count() }),
            )
            .await;
        }

        // 决策阶段忙时这次请求被忽略，下一帧会再触发
        let _ = self.decisions.trigger_decision();
        Ok(())
    }

    /// 内存压力：上报并在后台执行强制清理
    async fn on_memory_exhausted(&self, err: &PilotError) {
        if let Some(health) = &self.health {
            health
                .report_service_issue(MEMORY_SERVICE, &err.to_string())
                .await;
        }
        if let Some(recovery) = &self.recovery {
            let recovery = Arc::clone(recovery);
            let cause = RecoveryCause::from(err);
            tokio::spawn(async move {
                let outcome = recovery.recover_detailed(MEMORY_SERVICE, cause).await;
                if let Err(e) = outcome.into_result(MEMORY_SERVICE) {
                    tracing::debug!("Forced cleanup skipped: {}", e);
                }
            });
        }
    }

    /// 降容量回退：按剩余预算降采样后重新登记
    fn reduced_capacity(&self, frame: &FrameBuffer) -> Option<(FrameBuffer, BufferLease)> {
        let reduced = frame.downscaled(self.memory.available_bytes())?;
        let lease = self.memory.retain(Arc::clone(&reduced.data)).ok()?;
        self.stats.frame_downscaled();
        tracing::debug!(
            "Frame {} downscaled to {}x{} ({} bytes) under memory pressure",
            reduced.seq,
            reduced.width,
            reduced.height,
            reduced.len()
        );
        Some((reduced, lease))
    }

    async fn report_error(&self, message: &str) {
        self.listeners.synchronization_error(message).await;
        if let Some(bus) = &self.bus {
            bus.send(
                BUS_SENDER,
                BUS_RECEIVER,
                kinds::SYNC_ERROR,
                json!({ "message": message }),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecisionSection;
    use crate::pipeline::events::{PipelineEvent, RecordingListener};
    use crate::pipeline::learning::{LearningLoop, RewardShaping};
    use crate::perception::ScriptedDetector;
    use crate::policy::{GameAction, HeuristicPolicy};
    use std::time::Duration;

    struct Fixture {
        pipeline: Arc<FramePipeline>,
        state: Arc<SharedGameState>,
        supervisor: SessionSupervisor,
        memory: Arc<BufferTracker>,
        listener: Arc<RecordingListener>,
    }

    async fn fixture(detector: ScriptedDetector, memory_limit: usize) -> Fixture {
        let state = Arc::new(SharedGameState::new());
        let scheduler = Arc::new(TaskScheduler::new(2));
        let stats = Arc::new(PipelineStats::new());
        let listeners = Listeners::new();
        let listener = RecordingListener::new();
        listeners.add(listener.clone()).await;
        let learning = Arc::new(LearningLoop::new(RewardShaping::default(), stats.clone()));
        let decisions = Arc::new(DecisionSynchronizer::new(
            &DecisionSection::default(),
            state.clone(),
            scheduler.clone(),
            learning,
            listeners.clone(),
            stats.clone(),
        ));
        decisions
            .register_components(vec![Arc::new(HeuristicPolicy::new())])
            .await
            .unwrap();
        let memory = BufferTracker::new(memory_limit);
        let supervisor = SessionSupervisor::new();
        let pipeline = Arc::new(FramePipeline::new(
            Arc::new(detector),
            state.clone(),
            scheduler,
            decisions,
            memory.clone(),
            supervisor.clone(),
            listeners,
            stats,
        ));
        Fixture {
            pipeline,
            state,
            supervisor,
            memory,
            listener,
        }
    }

    fn frame(seq: u64) -> FrameBuffer {
        FrameBuffer::new(seq, 4, 4, vec![0u8; 16])
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_frame_updates_state_and_triggers_decision() {
        let f = fixture(ScriptedDetector::new(), 1024).await;
        f.pipeline.submit(frame(1)).unwrap().await.unwrap();
        settle().await;

        let state = f.state.snapshot().await.unwrap();
        assert_eq!(state.frame_seq, 1);
        assert_eq!(state.entity_count(), 1);
        // 帧 1 有一个 target，启发式策略点击
        let latest = f.pipeline.decisions().latest_decision().await.unwrap();
        assert_eq!(latest.action, GameAction::Tap);
        assert!(f
            .listener
            .events()
            .contains(&PipelineEvent::StateUpdated { frame_seq: 1, entities: 1 }));
        // 处理结束后缓冲租约已归还
        assert_eq!(f.memory.tracked_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_vision_stage_drops_frames() {
        let f = fixture(
            ScriptedDetector::new().with_latency(Duration::from_millis(50)),
            1024,
        )
        .await;
        let first = f.pipeline.submit(frame(1)).unwrap();
        assert_eq!(f.pipeline.submit(frame(2)).unwrap_err(), FrameRejected::Busy);
        first.await.unwrap();

        assert!(f.pipeline.submit(frame(3)).is_ok());
        let stats = f.pipeline.stats().snapshot();
        assert_eq!(stats.frames_submitted, 3);
        assert_eq!(stats.frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_paused_pipeline_drops_frames() {
        let f = fixture(ScriptedDetector::new(), 1024).await;
        f.supervisor.set_paused(true);
        assert_eq!(f.pipeline.submit(frame(1)).unwrap_err(), FrameRejected::Paused);
        assert!(f.state.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_detection_failure_reports_and_clears_flag() {
        let f = fixture(ScriptedDetector::new().with_failures(1), 1024).await;
        f.pipeline.submit(frame(1)).unwrap().await.unwrap();

        assert_eq!(f.listener.errors().len(), 1);
        assert!(f.state.snapshot().await.is_none());
        assert_eq!(f.pipeline.stats().snapshot().detection_failures, 1);
        assert!(f.pipeline.submit(frame(2)).is_ok());
    }

    #[tokio::test]
    async fn test_oversize_frames_fall_back_to_reduced_capacity() {
        let f = fixture(ScriptedDetector::new(), 8).await;
        for seq in 1..=3 {
            f.pipeline.submit(frame(seq)).unwrap().await.unwrap();
            settle().await;
            assert_eq!(f.state.snapshot().await.unwrap().frame_seq, seq);
        }

        assert!(f.listener.errors().is_empty());
        assert_eq!(f.pipeline.stats().snapshot().frames_downscaled, 3);
        assert!(f.pipeline.decisions().latest_decision().await.is_some());
        assert_eq!(f.memory.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_memory_exhaustion_without_fallback_skips_frame() {
        let f = fixture(ScriptedDetector::new(), 0).await;
        f.pipeline.submit(frame(1)).unwrap().await.unwrap();

        assert!(f.state.snapshot().await.is_none());
        assert_eq!(f.listener.errors().len(), 1);
    }
}
