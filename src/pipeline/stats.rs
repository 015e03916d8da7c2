//! 管线运行计数

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// 累计奖励以百万分之一为单位存成整数
const REWARD_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_submitted: AtomicU64,
    frames_accepted: AtomicU64,
    frames_dropped: AtomicU64,
    frames_downscaled: AtomicU64,
    detection_failures: AtomicU64,
    decisions_published: AtomicU64,
    decisions_degraded: AtomicU64,
    learning_runs: AtomicU64,
    learning_shed: AtomicU64,
    actuation_failures: AtomicU64,
    reward_micros: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub frames_submitted: u64,
    pub frames_accepted: u64,
    pub frames_dropped: u64,
    /// 超出缓冲预算、以降采样副本处理的帧
    pub frames_downscaled: u64,
    pub detection_failures: u64,
    pub decisions_published: u64,
    pub decisions_degraded: u64,
    pub learning_runs: u64,
    pub learning_shed: u64,
    /// 执行器报错或拒绝执行的次数
    pub actuation_failures: u64,
    pub cumulative_reward: f64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_submitted(&self) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_accepted(&self) {
        self.frames_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_downscaled(&self) {
        self.frames_downscaled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn detection_failed(&self) {
        self.detection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decision_published(&self, degraded: bool) {
        self.decisions_published.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.decisions_degraded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn learning_run(&self, reward: f32) {
        self.learning_runs.fetch_add(1, Ordering::Relaxed);
        let micros = (f64::from(reward) * REWARD_SCALE).round() as i64;
        self.reward_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub(crate) fn learning_shed(&self) {
        self.learning_shed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn actuation_failed(&self) {
        self.actuation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_downscaled: self.frames_downscaled.load(Ordering::Relaxed),
            detection_failures: self.detection_failures.load(Ordering::Relaxed),
            decisions_published: self.decisions_published.load(Ordering::Relaxed),
            decisions_degraded: self.decisions_degraded.load(Ordering::Relaxed),
            learning_runs: self.learning_runs.load(Ordering::Relaxed),
            learning_shed: self.learning_shed.load(Ordering::Relaxed),
            actuation_failures: self.actuation_failures.load(Ordering::Relaxed),
            cumulative_reward: self.reward_micros.load(Ordering::Relaxed) as f64 / REWARD_SCALE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reward() {
        let stats = PipelineStats::new();
        stats.frame_submitted();
        stats.frame_submitted();
        stats.frame_dropped();
        stats.decision_published(true);
        stats.learning_run(0.3);
        stats.learning_run(0.1);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_submitted, 2);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.decisions_degraded, 1);
        assert_eq!(snap.learning_runs, 2);
        assert!((snap.cumulative_reward - 0.4).abs() < 1e-6);
    }
}
