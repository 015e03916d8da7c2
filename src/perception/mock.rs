//! 模拟协作者（用于演示与测试，无需真实游戏画面）
//!
//! SyntheticCapture 按序号生成灰度帧，可配置周期性丢帧；ScriptedDetector 按帧序号生成确定性的实体，可配置周期性失败；
//! LoggingActuator 记录并打印收到的动作。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Actuator, Capture, Detector, FrameBuffer};
use crate::core::{BoundingBox, DetectedEntity, PilotError};
use crate::policy::GameAction;

/// 生成固定尺寸合成帧的帧来源
#[derive(Debug)]
pub struct SyntheticCapture {
    width: u32,
    height: u32,
    next_seq: AtomicU64,
    /// 每 N 帧丢一帧（返回采集错误），0 表示从不失败
    fail_every: u64,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            next_seq: AtomicU64::new(1),
            fail_every: 0,
        }
    }

    pub fn with_failures(mut self, fail_every: u64) -> Self {
        self.fail_every = fail_every;
        self
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new(64, 36)
    }
}

#[async_trait]
impl Capture for SyntheticCapture {
    async fn next_frame(&self) -> Result<FrameBuffer, PilotError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if self.fail_every > 0 && seq % self.fail_every == 0 {
            return Err(PilotError::CaptureFailed(format!("frame {seq} not delivered")));
        }
        let shade = (seq % 256) as u8;
        let data = vec![shade; (self.width * self.height) as usize];
        Ok(FrameBuffer::new(seq, self.width, self.height, data))
    }
}

/// 确定性检测器：帧序号决定实体数量与位置
#[derive(Debug, Default)]
pub struct ScriptedDetector {
    /// 每 N 帧失败一次，0 表示从不失败
    fail_every: u64,
    /// 每次检测的模拟耗时
    latency: Duration,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failures(mut self, fail_every: u64) -> Self {
        self.fail_every = fail_every;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn detect(&self, frame: &FrameBuffer) -> Result<Vec<DetectedEntity>, PilotError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_every > 0 && frame.seq % self.fail_every == 0 {
            return Err(PilotError::DetectionFailed(format!(
                "scripted failure on frame {}",
                frame.seq
            )));
        }

        let count = (frame.seq % 4) as usize;
        let entities = (0..count)
            .map(|i| {
                let offset = i as f32 * 0.2;
                let x = ((frame.seq as f32 * 0.07) + offset) % 0.8;
                DetectedEntity::new(
                    if i == 0 { "target" } else { "obstacle" },
                    BoundingBox::new(x, 0.5 - offset / 2.0, 0.1, 0.1),
                    0.95 - offset,
                )
            })
            .collect();
        Ok(entities)
    }
}

/// 记录动作的执行器
#[derive(Debug, Default)]
pub struct LoggingActuator {
    executed: RwLock<Vec<GameAction>>,
}

impl LoggingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn executed(&self) -> Vec<GameAction> {
        self.executed.read().await.clone()
    }
}

#[async_trait]
impl Actuator for LoggingActuator {
    async fn execute(&self, action: GameAction) -> Result<bool, PilotError> {
        tracing::debug!("Actuator executing '{}'", action);
        self.executed.write().await.push(action);
        Ok(action != GameAction::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_sequence_increments() {
        let capture = SyntheticCapture::new(4, 4);
        let a = capture.next_frame().await.unwrap();
        let b = capture.next_frame().await.unwrap();
        assert_eq!(b.seq, a.seq + 1);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn test_capture_scripted_failures() {
        let capture = SyntheticCapture::new(2, 2).with_failures(3);
        assert!(capture.next_frame().await.is_ok());
        assert!(capture.next_frame().await.is_ok());
        let err = capture.next_frame().await.unwrap_err();
        assert!(matches!(err, PilotError::CaptureFailed(_)));
        assert_eq!(capture.next_frame().await.unwrap().seq, 4);
    }

    #[tokio::test]
    async fn test_detector_scripted_failures() {
        let detector = ScriptedDetector::new().with_failures(2);
        let ok = FrameBuffer::new(3, 1, 1, vec![0]);
        let bad = FrameBuffer::new(4, 1, 1, vec![0]);
        assert_eq!(detector.detect(&ok).await.unwrap().len(), 3);
        assert!(detector.detect(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_actuator_records_actions() {
        let actuator = LoggingActuator::new();
        assert!(actuator.execute(GameAction::Tap).await.unwrap());
        assert!(!actuator.execute(GameAction::None).await.unwrap());
        assert_eq!(
            actuator.executed().await,
            vec![GameAction::Tap, GameAction::None]
        );
    }
}
